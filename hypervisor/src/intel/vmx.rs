//! Entering and leaving VMX operation on the current processor.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.7 ENABLING AND ENTERING VMX OPERATION

use {
    crate::{
        error::HypervisorError,
        intel::vmcs::revision_id,
        platform::{PageAllocation, Platform},
    },
    x86::msr,
};

const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// The VMXON region and the VMCS of one processor, each a single physically contiguous page.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
#[derive(Debug, Copy, Clone)]
pub struct VmxRegions {
    pub vmxon: PageAllocation,
    pub vmcs: PageAllocation,
}

impl VmxRegions {
    /// Allocates both regions and stamps them with the processor's VMCS revision identifier.
    pub fn allocate(platform: &dyn Platform) -> Result<Self, HypervisorError> {
        let revision = revision_id(platform).to_le_bytes();

        let vmxon = platform.allocate_pages(1).ok_or(HypervisorError::OutOfPool)?;
        let Some(vmcs) = platform.allocate_pages(1) else {
            platform.free_pages(vmxon, 1);
            return Err(HypervisorError::OutOfPool);
        };

        for region in [vmxon, vmcs] {
            if !platform.write_physical(region.pa, &revision) {
                platform.free_pages(vmxon, 1);
                platform.free_pages(vmcs, 1);
                return Err(HypervisorError::VirtualToPhysicalAddressFailed);
            }
        }

        log::trace!("VMXON region {:#x}, VMCS {:#x}", vmxon.pa, vmcs.pa);
        Ok(Self { vmxon, vmcs })
    }

    pub fn free(self, platform: &dyn Platform) {
        platform.free_pages(self.vmxon, 1);
        platform.free_pages(self.vmcs, 1);
    }
}

/// Locks IA32_FEATURE_CONTROL with VMXON outside SMX allowed, unless the firmware already locked
/// it.
///
/// # Returns
///
/// An error if the firmware locked the MSR with VMX disabled.
pub fn set_lock_bit(platform: &dyn Platform) -> Result<(), HypervisorError> {
    let feature_control = platform.rdmsr(msr::IA32_FEATURE_CONTROL).ok_or(HypervisorError::UnsupportedProcessor)?;

    if feature_control & FEATURE_CONTROL_LOCK == 0 {
        let value = feature_control | FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMXON_OUTSIDE_SMX;
        if !platform.wrmsr(msr::IA32_FEATURE_CONTROL, value) {
            return Err(HypervisorError::UnsupportedProcessor);
        }
    } else if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
        log::error!("VMX is disabled in the firmware");
        return Err(HypervisorError::UnsupportedProcessor);
    }

    Ok(())
}

/// Applies the fixed-0 and fixed-1 constraints of VMX operation to a CR0 or CR4 value.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.8 RESTRICTIONS ON VMX OPERATION
pub fn apply_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> u64 {
    (value | fixed0) & fixed1
}

/// Sets CR4.VMXE, locks the feature control MSR, fixes CR0 and CR4, and executes VMXON.
#[cfg(windows)]
pub fn enter_vmx_operation(platform: &dyn Platform, regions: &VmxRegions) -> Result<(), HypervisorError> {
    use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};

    let mut cr4_value = unsafe { cr4() };
    cr4_value.insert(Cr4::CR4_ENABLE_VMX);
    unsafe { cr4_write(cr4_value) };

    set_lock_bit(platform)?;

    let fixed = |index: u32| platform.rdmsr(index).unwrap_or(0);

    let cr0_value = apply_fixed_bits(unsafe { cr0() }.bits() as u64, fixed(msr::IA32_VMX_CR0_FIXED0), fixed(msr::IA32_VMX_CR0_FIXED1));
    unsafe { cr0_write(Cr0::from_bits_truncate(cr0_value as usize)) };

    let cr4_value = apply_fixed_bits(unsafe { cr4() }.bits() as u64, fixed(msr::IA32_VMX_CR4_FIXED0), fixed(msr::IA32_VMX_CR4_FIXED1));
    unsafe { cr4_write(Cr4::from_bits_truncate(cr4_value as usize)) };

    crate::intel::support::vmxon(regions.vmxon.pa)?;
    crate::intel::support::vmclear(regions.vmcs.pa)?;
    crate::intel::support::vmptrld(regions.vmcs.pa)
}

/// Executes VMXOFF and clears CR4.VMXE.
#[cfg(windows)]
pub fn leave_vmx_operation() -> Result<(), HypervisorError> {
    use x86::controlregs::{cr4, cr4_write, Cr4};

    crate::intel::support::vmxoff()?;

    let mut cr4_value = unsafe { cr4() };
    cr4_value.remove(Cr4::CR4_ENABLE_VMX);
    unsafe { cr4_write(cr4_value) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_unlocked_feature_control_gets_locked() {
        let platform = MockPlatform::new(1);
        platform.set_msr(msr::IA32_FEATURE_CONTROL, 0);

        set_lock_bit(&platform).unwrap();

        assert_eq!(platform.msr(msr::IA32_FEATURE_CONTROL), Some(0b101));
    }

    #[test]
    fn test_firmware_disabled_vmx_is_rejected() {
        let platform = MockPlatform::new(1);
        platform.set_msr(msr::IA32_FEATURE_CONTROL, FEATURE_CONTROL_LOCK);

        assert_eq!(set_lock_bit(&platform), Err(HypervisorError::UnsupportedProcessor));
    }

    #[test]
    fn test_fixed_bits() {
        assert_eq!(apply_fixed_bits(0x10, 0x8000_0021, 0xFFFF_FFFF), 0x8000_0031);
        assert_eq!(apply_fixed_bits(0xFFFF, 0, 0xFF), 0xFF);
    }

    #[test]
    fn test_regions_carry_revision_id() {
        let platform = MockPlatform::new(1);
        platform.set_msr(msr::IA32_VMX_BASIC, 0x00DA_0400_0000_0004);

        let regions = VmxRegions::allocate(&platform).unwrap();

        assert_eq!(platform.read_memory(regions.vmxon.pa, 4), [4, 0, 0, 0]);
        assert_eq!(platform.read_memory(regions.vmcs.pa, 4), [4, 0, 0, 0]);
        regions.free(&platform);
    }
}
