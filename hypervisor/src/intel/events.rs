//! Event injection into the guest on the next VM entry.
//!
//! Guest-directed exceptions and interrupts are delivered through the VM-entry interruption
//! information field. Software exceptions and software interrupts also need the instruction
//! length so that the pushed return address points after the instruction.

use {
    crate::{
        intel::vmerror::{ExceptionInterrupt, VmExitInterruptionInformation},
        platform::Platform,
    },
    bitfield::bitfield,
    x86::vmx::vmcs,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);
    impl Debug;

    pub u8, vector, set_vector: 7, 0;
    pub u8, interruption_type, set_interruption_type: 10, 8;
    pub deliver_error_code, set_deliver_error_code: 11;
    pub valid, set_valid: 31;
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    /// INT n.
    SoftwareInterrupt = 4,
    /// INT1.
    PrivilegedSoftwareException = 5,
    /// INT3 or INTO.
    SoftwareException = 6,
}

impl InterruptionType {
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            0 => InterruptionType::ExternalInterrupt,
            2 => InterruptionType::NonMaskableInterrupt,
            3 => InterruptionType::HardwareException,
            4 => InterruptionType::SoftwareInterrupt,
            5 => InterruptionType::PrivilegedSoftwareException,
            6 => InterruptionType::SoftwareException,
            _ => return None,
        })
    }

    /// Whether delivery needs the VM-entry instruction length.
    fn needs_instruction_length(self) -> bool {
        matches!(
            self,
            InterruptionType::SoftwareInterrupt
                | InterruptionType::PrivilegedSoftwareException
                | InterruptionType::SoftwareException
        )
    }
}

/// Exceptions that push an error code.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Exceptions and Interrupts
pub fn vector_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21)
}

impl EventInjection {
    pub fn new(vector: u8, interruption_type: InterruptionType, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(vector);
        event.set_interruption_type(interruption_type as u8);
        event.set_deliver_error_code(deliver_error_code);
        event.set_valid(true);
        event
    }

    /// Queues an event for the next VM entry.
    ///
    /// # Arguments
    ///
    /// * `platform` - The platform providing VMWRITE.
    /// * `vector` - The interrupt or exception vector.
    /// * `interruption_type` - How the event is delivered.
    /// * `error_code` - Error code to push, if the vector has one.
    /// * `instruction_length` - Length of the instruction for software events.
    #[rustfmt::skip]
    pub fn inject(platform: &dyn Platform, vector: u8, interruption_type: InterruptionType, error_code: Option<u32>, instruction_length: u64) {
        let event = Self::new(vector, interruption_type, error_code.is_some());

        if let Some(error_code) = error_code {
            platform.vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64);
        }

        if interruption_type.needs_instruction_length() {
            platform.vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, instruction_length);
        }

        platform.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64);
        log::trace!("Injecting vector {} ({:?})", vector, interruption_type);
    }

    /// Inject General Protection (#GP) to the guest.
    pub fn inject_gp(platform: &dyn Platform, error_code: u32) {
        Self::inject(platform, ExceptionInterrupt::GeneralProtectionFault as u8, InterruptionType::HardwareException, Some(error_code), 0);
    }

    /// Inject Invalid Opcode (#UD) to the guest.
    pub fn inject_ud(platform: &dyn Platform) {
        Self::inject(platform, ExceptionInterrupt::InvalidOpcode as u8, InterruptionType::HardwareException, None, 0);
    }

    /// Inject Breakpoint (#BP) to the guest as if `int3` executed.
    pub fn inject_bp(platform: &dyn Platform) {
        Self::inject(platform, ExceptionInterrupt::Breakpoint as u8, InterruptionType::SoftwareException, None, 1);
    }

    /// Inject Debug (#DB) to the guest.
    pub fn inject_db(platform: &dyn Platform) {
        Self::inject(platform, ExceptionInterrupt::Debug as u8, InterruptionType::HardwareException, None, 0);
    }

    /// Inject Page Fault (#PF) to the guest for `address`. CR2 is not part of the VMCS and is
    /// written directly.
    pub fn inject_pf(platform: &dyn Platform, address: u64, error_code: u32) {
        platform.write_cr(2, address);
        Self::inject(platform, ExceptionInterrupt::PageFault as u8, InterruptionType::HardwareException, Some(error_code), 0);
    }

    /// Delivers the exception that caused the current exit back to the guest unchanged.
    pub fn reinject(platform: &dyn Platform, info: VmExitInterruptionInformation) {
        let Some(interruption_type) = InterruptionType::from_raw(info.interruption_type()) else {
            log::warn!("Cannot re-inject interruption type {}", info.interruption_type());
            return;
        };

        let error_code = info
            .error_code_valid()
            .then(|| platform.vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32);
        let instruction_length = platform.vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);

        Self::inject(platform, info.vector(), interruption_type, error_code, instruction_length);
    }

    /// Whether an event is already queued for the next VM entry.
    pub fn is_pending(platform: &dyn Platform) -> bool {
        EventInjection(platform.vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32).valid()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_gp_carries_error_code() {
        let platform = MockPlatform::new(1);
        EventInjection::inject_gp(&platform, 0);

        let info = EventInjection(platform.vmcs(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
        assert_eq!(info.vector(), 13);
        assert_eq!(info.interruption_type(), InterruptionType::HardwareException as u8);
        assert!(info.deliver_error_code());
        assert!(info.valid());
        assert!(EventInjection::is_pending(&platform));
    }

    #[test]
    fn test_breakpoint_is_software_exception() {
        let platform = MockPlatform::new(1);
        EventInjection::inject_bp(&platform);

        let info = EventInjection(platform.vmcs(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
        assert_eq!(info.vector(), 3);
        assert!(!info.deliver_error_code());
        assert_eq!(platform.vmcs(vmcs::control::VMENTRY_INSTRUCTION_LEN), 1);
    }

    #[test]
    fn test_page_fault_sets_cr2() {
        let platform = MockPlatform::new(1);
        EventInjection::inject_pf(&platform, 0xDEAD_0000, 2);
        assert_eq!(platform.read_cr(2), 0xDEAD_0000);
        assert_eq!(platform.vmcs(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE), 2);
    }
}
