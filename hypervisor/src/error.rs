use thiserror_no_std::Error;

/// Faults raised while evaluating a script blob.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Script exceeded its instruction budget")]
    BudgetExceeded,
    #[error("Invalid opcode {0:#x}")]
    InvalidOpcode(u64),
    #[error("Script stack underflow")]
    StackUnderflow,
    #[error("Script stack overflow")]
    StackOverflow,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Invalid operand of type {0:#x}")]
    InvalidOperand(u64),
    #[error("Script dereferenced an inaccessible address")]
    MemoryAccess,
    #[error("Malformed script blob")]
    MalformedBlob,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Processor lacks VT-x or a required VMX capability")]
    UnsupportedProcessor,
    #[error("Preallocated pool could not satisfy the request")]
    OutOfPool,
    #[error("Event descriptor fields are out of range")]
    BadEventDescriptor,
    #[error("Unknown event type")]
    UnknownEventType,
    #[error("No event with the given tag")]
    TagNotFound,
    #[error("Could not activate the interception required by the event")]
    CouldNotActivateInterception,
    #[error("EPT split or shadow page allocation failed")]
    HookInstallFailed,
    #[error("Guest memory is not mapped or not accessible")]
    MemoryAccessFaulted,
    #[error("Script runtime error: {0}")]
    ScriptRuntimeError(ScriptError),
    #[error("Serial link is down")]
    LinkDown,
    #[error("Packet type or length is inconsistent with its header")]
    ProtocolMismatch,
    #[error("Operation is not valid in the current debugger state")]
    DebuggerBusy,
    #[error("Hypervisor is already hidden")]
    AlreadyHidden,
    #[error("Hypervisor is already visible")]
    AlreadyVisible,
    #[error("Breakpoint not found")]
    BreakpointNotFound,
    #[error("A breakpoint already exists at this address")]
    BreakpointAlreadyExists,
    #[error("Symbol not found")]
    SymbolNotFound,
    #[error("Failed to execute VMXON")]
    VmxonFailed,
    #[error("Failed to execute VMXOFF")]
    VmxoffFailed,
    #[error("Failed to execute VMCLEAR")]
    VmclearFailed,
    #[error("Failed to execute VMPTRLD")]
    VmptrldFailed,
    #[error("Failed to execute VMWRITE")]
    VmwriteFailed,
    #[error("Failed to execute VMLAUNCH")]
    VmlaunchFailed,
    #[error("Unknown VM exit reason")]
    UnknownVmExitReason,
    #[error("Unhandled VM exit")]
    UnhandledVmExit,
    #[error("EPT PML4 base address is not 4KB aligned")]
    InvalidEptPml4BaseAddress,
    #[error("Failed to resolve memory type for a physical range")]
    MemoryTypeResolutionError,
    #[error("Failed to switch execution to another processor")]
    ProcessorSwitchFailed,
    #[error("Failed to translate a virtual address to a physical address")]
    VirtualToPhysicalAddressFailed,
    #[error("Core state is not initialized")]
    NotInitialized,
    #[error("A processor did not flush its EPT translations in time")]
    SynchronizationTimedOut,
}

impl From<ScriptError> for HypervisorError {
    fn from(error: ScriptError) -> Self {
        HypervisorError::ScriptRuntimeError(error)
    }
}

/// Numeric codes carried on the wire and through IOCTL output buffers.
///
/// `0xFFFFFFFF` marks success, other values are error codes.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebuggerErrorCode {
    Success = 0xFFFF_FFFF,
    TagNotExists = 0xC000_0000,
    InvalidActionType = 0xC000_0001,
    EventTypeIsInvalid = 0xC000_0006,
    UnableToHookAddress = 0xC000_0007,
    InvalidAddress = 0xC000_0008,
    InvalidCoreId = 0xC000_0009,
    ExceptionIndexExceedsFirst32Entries = 0xC000_000A,
    InterruptIndexIsNotValid = 0xC000_000B,
    UnableToCreateActionCannotAllocateBuffer = 0xC000_000F,
    ModifyEventsInvalidTypeOfAction = 0xC000_0019,
    MaximumBreakpointForASinglePageIsHit = 0xC000_0021,
    PreAllocatedBufferIsEmpty = 0xC000_0022,
    EptCouldNotSplitTheLargePageTo4kbPages = 0xC000_0023,
    EptFailedToGetPml1EntryOfTargetAddress = 0xC000_0024,
    EptMultipleHooksInASinglePage = 0xC000_0025,
    CouldNotBuildTheEptHook = 0xC000_0026,
    BreakpointAlreadyExistsOnTheAddress = 0xC000_0027,
    BreakpointIdNotFound = 0xC000_0028,
    InvalidRegisterNumber = 0xC000_002B,
    ScriptRuntimeFailed = 0xC000_0030,
    DebuggerIsNotPaused = 0xC000_0031,
    ShortCircuitingStateIsInvalidForPostEvents = 0xC000_0034,
    ProtocolMismatch = 0xC000_0040,
    LinkDown = 0xC000_0041,
    AlreadyHidden = 0xC000_0042,
    AlreadyVisible = 0xC000_0043,
    UnsupportedProcessor = 0xC000_0044,
    InternalError = 0xC000_00FF,
}

impl From<HypervisorError> for DebuggerErrorCode {
    fn from(error: HypervisorError) -> Self {
        match error {
            HypervisorError::TagNotFound => DebuggerErrorCode::TagNotExists,
            HypervisorError::UnknownEventType => DebuggerErrorCode::EventTypeIsInvalid,
            HypervisorError::BadEventDescriptor => DebuggerErrorCode::InvalidAddress,
            HypervisorError::HookInstallFailed | HypervisorError::SynchronizationTimedOut => DebuggerErrorCode::CouldNotBuildTheEptHook,
            HypervisorError::OutOfPool => DebuggerErrorCode::PreAllocatedBufferIsEmpty,
            HypervisorError::MemoryAccessFaulted => DebuggerErrorCode::InvalidAddress,
            HypervisorError::ScriptRuntimeError(_) => DebuggerErrorCode::ScriptRuntimeFailed,
            HypervisorError::DebuggerBusy => DebuggerErrorCode::DebuggerIsNotPaused,
            HypervisorError::ProtocolMismatch => DebuggerErrorCode::ProtocolMismatch,
            HypervisorError::LinkDown => DebuggerErrorCode::LinkDown,
            HypervisorError::AlreadyHidden => DebuggerErrorCode::AlreadyHidden,
            HypervisorError::AlreadyVisible => DebuggerErrorCode::AlreadyVisible,
            HypervisorError::UnsupportedProcessor => DebuggerErrorCode::UnsupportedProcessor,
            HypervisorError::BreakpointNotFound => DebuggerErrorCode::BreakpointIdNotFound,
            HypervisorError::BreakpointAlreadyExists => DebuggerErrorCode::BreakpointAlreadyExistsOnTheAddress,
            HypervisorError::CouldNotActivateInterception => DebuggerErrorCode::UnableToHookAddress,
            _ => DebuggerErrorCode::InternalError,
        }
    }
}

/// Converts an engine result into the status word sent back to the requester.
pub fn status_of<T>(result: &Result<T, HypervisorError>) -> u32 {
    match result {
        Ok(_) => DebuggerErrorCode::Success as u32,
        Err(error) => DebuggerErrorCode::from(*error) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_wraps_into_runtime_error() {
        let error: HypervisorError = ScriptError::DivisionByZero.into();
        assert_eq!(error, HypervisorError::ScriptRuntimeError(ScriptError::DivisionByZero));
        assert_eq!(DebuggerErrorCode::from(error), DebuggerErrorCode::ScriptRuntimeFailed);
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of::<()>(&Ok(())), 0xFFFF_FFFF);
        assert_eq!(status_of::<()>(&Err(HypervisorError::TagNotFound)), 0xC000_0000);
    }
}
