//! Module for handling VMX control adjustments.
//! Requested control values are reconciled with the allowed-0 and allowed-1 settings the
//! processor reports in its capability MSRs.

use {crate::platform::Platform, x86::msr};

/// Enumerates the types of VMX control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    /// The capability MSR describing this control.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.3 VM-EXECUTION CONTROLS
    fn capability_msr(self, true_controls: bool) -> u32 {
        match (self, true_controls) {
            (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
            (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
            (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
            (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
            (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
            (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
            // There is no TRUE MSR for the secondary processor-based controls.
            (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        }
    }
}

/// Applies a capability MSR value to a requested control value.
///
/// The low half holds the bits that must be 1, the high half the bits that may be 1.
pub fn apply_capabilities(capabilities: u64, requested_value: u64) -> u64 {
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = requested_value as u32;
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

/// Adjusts the VMX controls based on the requested value and capabilities.
///
/// # Arguments
///
/// * `platform` - The platform the capability MSRs are read from.
/// * `control` - The type of VMX control to be adjusted.
/// * `requested_value` - The desired value for the control.
///
/// # Returns
///
/// Returns the adjusted control value based on system capabilities and the requested value.
pub fn adjust_vmx_controls(platform: &dyn Platform, control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_VMX_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = platform.rdmsr(msr::IA32_VMX_BASIC).unwrap_or(0);
    let true_cap_msr_supported = (vmx_basic & IA32_VMX_BASIC_VMX_CONTROLS_FLAG) != 0;

    let capabilities = platform
        .rdmsr(control.capability_msr(true_cap_msr_supported))
        .unwrap_or(0xFFFF_FFFF_0000_0000);

    apply_capabilities(capabilities, requested_value)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_allowed_bits_are_enforced() {
        // Bit 1 must be set, bit 3 may not be set.
        let capabilities = (0xFFFF_FFF7u64 << 32) | 0x2;
        assert_eq!(apply_capabilities(capabilities, 0b1001), 0b0011);
    }

    #[test]
    fn test_true_controls_are_preferred() {
        let platform = MockPlatform::new(1);
        platform.set_msr(msr::IA32_VMX_BASIC, 1 << 55);
        platform.set_msr(msr::IA32_VMX_TRUE_PROCBASED_CTLS, (0xFFFF_FFFFu64 << 32) | 0x10);
        platform.set_msr(msr::IA32_VMX_PROCBASED_CTLS, (0xFFFF_FFFFu64 << 32) | 0x20);

        assert_eq!(adjust_vmx_controls(&platform, VmxControl::ProcessorBased, 0x1), 0x11);
    }
}
