//! Decoding of the read-only VM-exit information fields.
//!
//! Exit reasons, VM-instruction errors and the exit qualifications of the exits the debugger
//! intercepts. Every decoder is a pure function of the raw field value.

use {
    crate::platform::AccessSize,
    bitfield::bitfield,
};

/// Represents the basic VM exit reasons the dispatcher distinguishes.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    MonitorTrapFlag = 37,
    VmEntryFailureMachineCheckEvent = 41,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
}

impl VmxBasicExitReason {
    /// Converts the 32-bit exit reason field. The lower 16 bits form the basic exit reason.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.1 VM Exit Reason
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        let reason = match value & 0xFFFF {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmxoff,
            27 => Vmxon,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            37 => MonitorTrapFlag,
            41 => VmEntryFailureMachineCheckEvent,
            48 => EptViolation,
            49 => EptMisconfiguration,
            50 => Invept,
            51 => Rdtscp,
            52 => VmxPreemptionTimerExpired,
            53 => Invvpid,
            54 => WbinvdOrWbnoinvd,
            55 => Xsetbv,
            _ => return None,
        };

        Some(reason)
    }

    /// Whether the exit is one of the VMX instructions a guest may not execute.
    pub fn is_vmx_instruction(self) -> bool {
        matches!(
            self,
            Self::Vmclear
                | Self::Vmlaunch
                | Self::Vmptrld
                | Self::Vmptrst
                | Self::Vmread
                | Self::Vmresume
                | Self::Vmwrite
                | Self::Vmxoff
                | Self::Vmxon
                | Self::Invept
                | Self::Invvpid
        )
    }
}

/// VM-instruction error numbers reported after a failed VMLAUNCH or VMRESUME.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 31-1. VM-Instruction Error Numbers
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmInstructionError {
    VmcallInRoot = 1,
    VmclearInvalidAddress = 2,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmEntryInvalidControlFields = 7,
    VmEntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldIncorrectVmcsRevision = 11,
    VmreadVmwriteUnsupportedVmcsComponent = 12,
    VmwriteReadonlyVmcsComponent = 13,
    VmxonInRoot = 15,
    VmEntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmInstructionError::*;

        Some(match value {
            1 => VmcallInRoot,
            2 => VmclearInvalidAddress,
            4 => VmlaunchNonClearVmcs,
            5 => VmresumeNonLaunchedVmcs,
            7 => VmEntryInvalidControlFields,
            8 => VmEntryInvalidHostState,
            9 => VmptrldInvalidAddress,
            11 => VmptrldIncorrectVmcsRevision,
            12 => VmreadVmwriteUnsupportedVmcsComponent,
            13 => VmwriteReadonlyVmcsComponent,
            15 => VmxonInRoot,
            26 => VmEntryEventsBlockedByMovSs,
            28 => InvalidOperandToInveptInvvpid,
            _ => return None,
        })
    }
}

/// Exception vectors the engine reacts to.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Exceptions and Interrupts
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    InvalidOpcode = 6,
    DoubleFault = 8,
    GeneralProtectionFault = 13,
    PageFault = 14,
}

impl ExceptionInterrupt {
    pub fn from_vector(vector: u8) -> Option<Self> {
        use ExceptionInterrupt::*;

        Some(match vector {
            0 => DivideError,
            1 => Debug,
            2 => NonMaskableInterrupt,
            3 => Breakpoint,
            6 => InvalidOpcode,
            8 => DoubleFault,
            13 => GeneralProtectionFault,
            14 => PageFault,
            _ => return None,
        })
    }
}

bitfield! {
    /// VM-exit interruption-information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-19. Format of the VM-Exit Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct VmExitInterruptionInformation(u32);
    impl Debug;

    pub u8, vector, _: 7, 0;
    pub u8, interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub nmi_unblocking_due_to_iret, _: 12;
    pub valid, _: 31;
}

bitfield! {
    /// Exit qualification for EPT violations.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EptViolationQualification(u64);
    impl Debug;

    pub data_read, _: 0;
    pub data_write, _: 1;
    pub instruction_fetch, _: 2;
    pub readable, _: 3;
    pub writable, _: 4;
    pub executable, _: 5;
    pub guest_linear_address_valid, _: 7;
    pub caused_by_translation, _: 8;
}

/// Kind of control-register access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CrAccessQualification(u64);
    impl Debug;

    pub u8, control_register, _: 3, 0;
    pub u8, raw_access_type, _: 5, 4;
    pub lmsw_memory_operand, _: 6;
    pub u8, gpr, _: 11, 8;
    pub u16, lmsw_source, _: 31, 16;
}

impl CrAccessQualification {
    pub fn access_type(&self) -> CrAccessType {
        match self.raw_access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

bitfield! {
    /// Exit qualification for MOV DR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-4. Exit Qualification for MOV DR
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DrAccessQualification(u64);
    impl Debug;

    pub u8, debug_register, _: 2, 0;
    /// 0 = MOV to DR, 1 = MOV from DR.
    pub direction_read, _: 4;
    pub u8, gpr, _: 11, 8;
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IoQualification(u64);
    impl Debug;

    pub raw_size, _: 2, 0;
    /// 0 = OUT, 1 = IN.
    pub direction_in, _: 3;
    pub string, _: 4;
    pub rep, _: 5;
    pub immediate_operand, _: 6;
    pub u16, port, _: 31, 16;
}

impl IoQualification {
    pub fn size(&self) -> Option<AccessSize> {
        AccessSize::from_qualification(self.raw_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_uses_low_word() {
        assert_eq!(VmxBasicExitReason::from_u32(0x8000_001F), Some(VmxBasicExitReason::Rdmsr));
        assert_eq!(VmxBasicExitReason::from_u32(35), None);
        assert!(VmxBasicExitReason::Vmxon.is_vmx_instruction());
        assert!(!VmxBasicExitReason::Cpuid.is_vmx_instruction());
    }

    #[test]
    fn test_cr_access_qualification() {
        // mov cr3, rbx
        let qualification = CrAccessQualification(0x3 | (3 << 8));
        assert_eq!(qualification.control_register(), 3);
        assert_eq!(qualification.access_type(), CrAccessType::MovToCr);
        assert_eq!(qualification.gpr(), 3);

        // mov rax, cr8
        let qualification = CrAccessQualification(0x8 | (1 << 4));
        assert_eq!(qualification.access_type(), CrAccessType::MovFromCr);
        assert_eq!(qualification.gpr(), 0);
    }

    #[test]
    fn test_io_qualification() {
        // in al, dx with port 0x3F8
        let qualification = IoQualification((0x3F8 << 16) | (1 << 3));
        assert!(qualification.direction_in());
        assert_eq!(qualification.port(), 0x3F8);
        assert_eq!(qualification.size(), Some(AccessSize::Byte));

        let qualification = IoQualification(0x3);
        assert_eq!(qualification.size(), Some(AccessSize::Dword));
    }

    #[test]
    fn test_ept_violation_qualification() {
        let qualification = EptViolationQualification(0b10_0010);
        assert!(qualification.data_write());
        assert!(!qualification.data_read());
        assert!(qualification.executable());
        assert!(!qualification.readable());
    }
}
