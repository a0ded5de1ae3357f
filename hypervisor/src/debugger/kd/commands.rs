//! Payload layouts of the debugger requests and the debuggee replies.
//!
//! Every payload starts with a fixed-size little-endian header. Requests that carry data (memory
//! to write, a script, a search pattern) append it after the header; so do replies that return
//! data. `status` fields hold a [`DebuggerErrorCode`](crate::error::DebuggerErrorCode).

use {
    crate::{
        debugger::{
            callstack::{CallstackFrame, CALL_SITE_BYTES},
            events::{ActionDescriptor, ActionRequest, EventDescriptor, EventScope, EventStage, EventType},
        },
        error::HypervisorError,
        intel::registers::GuestRegisters,
        memory::mapper::{EntryLocation, PteQuery},
    },
    alloc::vec::Vec,
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

/// Instruction bytes sent with a halt report.
pub const PAUSED_INSTRUCTION_BYTES: usize = 16;

/// Reply payload of `QueryVersion`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Splits a payload into its header and the variable tail.
pub fn split<T: FromBytes>(payload: &[u8]) -> Result<(T, &[u8]), HypervisorError> {
    T::read_from_prefix(payload).map_err(|_| HypervisorError::ProtocolMismatch)
}

/// Joins a reply header and its tail.
pub fn join<T: IntoBytes + Immutable>(header: &T, tail: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(core::mem::size_of_val(header) + tail.len());
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(tail);
    payload
}

/// Register state of one processor.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterState {
    pub core: u32,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl RegisterState {
    pub fn capture(core: u32, registers: &GuestRegisters) -> Self {
        Self {
            core,
            rax: registers.rax,
            rbx: registers.rbx,
            rcx: registers.rcx,
            rdx: registers.rdx,
            rdi: registers.rdi,
            rsi: registers.rsi,
            rbp: registers.rbp,
            r8: registers.r8,
            r9: registers.r9,
            r10: registers.r10,
            r11: registers.r11,
            r12: registers.r12,
            r13: registers.r13,
            r14: registers.r14,
            r15: registers.r15,
            rip: registers.rip,
            rsp: registers.rsp,
            rflags: registers.rflags,
        }
    }
}

/// The halt report. Followed by one [`RegisterState`] per halted processor.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct PausedPacket {
    pub reason: u32,
    pub core: u32,
    pub tag: u64,
    pub context: u64,
    pub rip: u64,
    pub is_32bit: u8,
    pub instruction_length: u8,
    pub instruction_bytes: [u8; PAUSED_INSTRUCTION_BYTES],
    pub pid: u32,
    pub tid: u32,
    pub register_count: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct StartedPacket {
    pub version: u32,
    pub processor_count: u32,
}

/// Sent with packet type `DebuggeeCrash`. Followed by the message text.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct CrashPacket {
    pub core: u32,
    pub rip: u64,
    pub message_length: u32,
}

/// A `LoggingMechanism` packet. Followed by the message text.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct LogPacket {
    pub tag: u64,
    pub dropped: u64,
}

/// Generic reply carrying only a status.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket {
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct StepPacket {
    pub step_type: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ChangeCorePacket {
    pub core: u32,
    pub status: u32,
}

/// Queries the current process or thread, or switches to another one.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ChangeContextPacket {
    /// 0 queries, 1 switches.
    pub switch: u8,
    /// Process or thread id.
    pub id: u32,
    pub process: u64,
    pub thread: u64,
    pub name: [u8; 16],
    pub status: u32,
}

/// `ReadRegisters` request. Replies with a [`StatusPacket`] followed by register states.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ReadRegistersPacket {
    /// A processor, or `APPLY_TO_ALL` for every halted processor.
    pub core: u32,
}

/// Register numbers of `WriteRegister`: 0..=15 in instruction encoding order, then these.
pub const REGISTER_RIP: u32 = 16;
pub const REGISTER_RFLAGS: u32 = 17;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct WriteRegisterPacket {
    pub register: u32,
    pub value: u64,
    pub status: u32,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryType {
    Virtual = 0,
    Physical = 1,
}

impl MemoryType {
    pub fn from_u8(value: u8) -> Result<Self, HypervisorError> {
        match value {
            0 => Ok(MemoryType::Virtual),
            1 => Ok(MemoryType::Physical),
            _ => Err(HypervisorError::ProtocolMismatch),
        }
    }
}

/// `ReadMemory` request and reply header. The reply is followed by `size` bytes.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ReadMemoryPacket {
    pub address: u64,
    pub size: u32,
    pub memory_type: u8,
    /// Address space of the process, or `APPLY_TO_ALL` for the current one.
    pub pid: u32,
    pub status: u32,
}

/// `EditMemory` request, followed by `size` bytes to write.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct EditMemoryPacket {
    pub address: u64,
    pub size: u32,
    pub memory_type: u8,
    pub pid: u32,
    pub status: u32,
}

/// `SearchMemory` request, followed by the pattern. The reply is this header with `count` set,
/// followed by `count` addresses.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct SearchMemoryPacket {
    pub address: u64,
    pub length: u64,
    pub pid: u32,
    pub max_results: u32,
    pub count: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct AddressConversionPacket {
    pub virtual_address: u64,
    pub physical_address: u64,
    /// 1 converts the virtual address, 0 the physical one.
    pub is_virtual_to_physical: u8,
    pub pid: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct PtePacket {
    pub va: u64,
    pub pid: u32,
    pub pml4e_address: u64,
    pub pml4e_value: u64,
    pub pdpte_address: u64,
    pub pdpte_value: u64,
    pub pde_address: u64,
    pub pde_value: u64,
    pub pte_address: u64,
    pub pte_value: u64,
    pub status: u32,
}

impl PtePacket {
    pub fn fill(&mut self, query: &PteQuery) {
        let split = |entry: Option<EntryLocation>| entry.map_or((0, 0), |entry| (entry.address, entry.value));
        (self.pml4e_address, self.pml4e_value) = split(query.pml4e);
        (self.pdpte_address, self.pdpte_value) = split(query.pdpte);
        (self.pde_address, self.pde_value) = split(query.pde);
        (self.pte_address, self.pte_value) = split(query.pte);
    }
}

/// `RunScript` request, followed by the compiled blob.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct RunScriptPacket {
    pub script_length: u32,
    pub return_value: u64,
    pub status: u32,
}

/// `RegisterEvent` request, followed by `condition_length` bytes of compiled condition.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct RegisterEventPacket {
    pub event_type: u32,
    pub core: u32,
    pub pid: u32,
    pub tid: u32,
    pub params: [u64; 6],
    pub stage: u32,
    pub enabled: u8,
    pub short_circuit: u8,
    pub condition_length: u32,
    /// Tag assigned by the debuggee.
    pub tag: u64,
    pub status: u32,
}

impl RegisterEventPacket {
    pub fn descriptor(&self, tail: &[u8]) -> Result<EventDescriptor, HypervisorError> {
        let condition_length = self.condition_length as usize;
        if tail.len() < condition_length {
            return Err(HypervisorError::ProtocolMismatch);
        }

        Ok(EventDescriptor {
            event_type: EventType::from_u32(self.event_type)?,
            scope: EventScope { core: self.core, pid: self.pid, tid: self.tid },
            params: self.params,
            stage: EventStage::from_u32(self.stage)?,
            enabled: self.enabled != 0,
            short_circuit: self.short_circuit != 0,
            condition: (condition_length != 0).then(|| tail[..condition_length].to_vec()),
        })
    }
}

pub const ACTION_BREAK_TO_DEBUGGER: u32 = 0;
pub const ACTION_RUN_SCRIPT: u32 = 1;
pub const ACTION_RUN_CUSTOM_CODE: u32 = 2;

/// `AddActionToEvent` request, followed by `script_length` bytes of script.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct AddActionPacket {
    pub tag: u64,
    pub action_type: u32,
    pub immediate_messaging: u8,
    pub buffer_size: u32,
    pub repetition_limit: u64,
    pub custom_code: u32,
    pub script_length: u32,
    pub status: u32,
}

impl AddActionPacket {
    pub fn descriptor(&self, tail: &[u8]) -> Result<ActionDescriptor, HypervisorError> {
        let request = match self.action_type {
            ACTION_BREAK_TO_DEBUGGER => ActionRequest::BreakToDebugger,
            ACTION_RUN_SCRIPT => {
                let length = self.script_length as usize;
                let script = tail.get(..length).ok_or(HypervisorError::ProtocolMismatch)?;
                ActionRequest::RunScript(script.to_vec())
            }
            ACTION_RUN_CUSTOM_CODE => ActionRequest::RunCustomCode(self.custom_code),
            _ => return Err(HypervisorError::BadEventDescriptor),
        };

        Ok(ActionDescriptor {
            request,
            immediate_messaging: self.immediate_messaging != 0,
            buffer_size: self.buffer_size as usize,
            repetition_limit: self.repetition_limit,
        })
    }
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ModifyEventPacket {
    pub tag: u64,
    pub action: u32,
    pub is_enabled: u8,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ShortCircuitPacket {
    pub short_circuit: u8,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct BpPacket {
    pub address: u64,
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    pub remove_after_hit: u8,
    pub check_for_callbacks: u8,
    pub id: u64,
    pub status: u32,
}

pub const BREAKPOINT_LIST: u32 = 0;
pub const BREAKPOINT_ENABLE: u32 = 1;
pub const BREAKPOINT_DISABLE: u32 = 2;
pub const BREAKPOINT_CLEAR: u32 = 3;

/// `ListOrModifyBreakpoints` request. The reply sets `count` and is followed by that many
/// [`BreakpointEntry`] records.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct ModifyBreakpointPacket {
    pub request: u32,
    pub id: u64,
    pub count: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointEntry {
    pub id: u64,
    pub address: u64,
    pub pa: u64,
    pub enabled: u8,
}

/// `Callstack` request. The reply sets `count` and is followed by that many frames.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct CallstackPacket {
    pub base: u64,
    pub size: u32,
    pub is_32bit: u8,
    pub count: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct CallstackFrameEntry {
    pub stack_address: u64,
    pub value: u64,
    pub is_stack_address_valid: u8,
    pub is_valid_address: u8,
    pub is_executable: u8,
    pub is_return_address: u8,
    pub call_site: [u8; CALL_SITE_BYTES],
}

impl CallstackFrameEntry {
    pub fn from_frame(frame: &CallstackFrame, is_32bit: bool) -> Self {
        Self {
            stack_address: frame.stack_address,
            value: frame.value,
            is_stack_address_valid: u8::from(frame.is_stack_address_valid),
            is_valid_address: u8::from(frame.is_valid_address),
            is_executable: u8::from(frame.is_executable),
            is_return_address: u8::from(frame.is_return_address(is_32bit)),
            call_site: frame.call_site.unwrap_or_default(),
        }
    }
}

pub const TEST_QUERY_HALTED_CORES: u32 = 0;
pub const TEST_QUERY_EVENT_COUNT: u32 = 1;
pub const TEST_QUERY_BREAKPOINT_COUNT: u32 = 2;
pub const TEST_QUERY_POOL_RETIRED: u32 = 3;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct TestQueryPacket {
    pub option: u32,
    pub value: u64,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct PageFaultPacket {
    pub address: u64,
    pub error_code: u32,
    pub status: u32,
}

/// `SymbolReload` request, followed by module details then symbol records.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct SymbolReloadPacket {
    pub module_count: u32,
    pub symbol_count: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct FlushPacket {
    pub flushed: u32,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct VersionPacket {
    pub protocol: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::debugger::events::APPLY_TO_ALL,
        zerocopy::FromZeros,
    };

    #[test]
    fn test_register_event_descriptor() {
        let mut packet = RegisterEventPacket::new_zeroed();
        packet.event_type = EventType::RdmsrInstructionExecution as u32;
        packet.core = APPLY_TO_ALL;
        packet.pid = APPLY_TO_ALL;
        packet.tid = APPLY_TO_ALL;
        packet.params[0] = 0xC000_0082;
        packet.enabled = 1;
        packet.condition_length = 2;

        let payload = join(&packet, &[0xAA, 0xBB, 0xCC]);
        let (decoded, tail) = split::<RegisterEventPacket>(&payload).unwrap();
        let descriptor = decoded.descriptor(tail).unwrap();

        assert_eq!(descriptor.event_type, EventType::RdmsrInstructionExecution);
        assert_eq!(descriptor.params[0], 0xC000_0082);
        assert_eq!(descriptor.condition.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(descriptor.scope, EventScope::ALL);
    }

    #[test]
    fn test_truncated_payloads_are_rejected() {
        assert_eq!(split::<ReadMemoryPacket>(&[0; 4]).err(), Some(HypervisorError::ProtocolMismatch));

        let mut packet = AddActionPacket::new_zeroed();
        packet.action_type = ACTION_RUN_SCRIPT;
        packet.script_length = 32;
        assert_eq!(packet.descriptor(&[0; 16]), Err(HypervisorError::ProtocolMismatch));

        packet.action_type = 9;
        assert_eq!(packet.descriptor(&[]), Err(HypervisorError::BadEventDescriptor));
    }

    #[test]
    fn test_pte_packet_fill() {
        let query = PteQuery {
            va: 0x1000,
            pml4e: Some(EntryLocation { address: 0x10, value: 0x11 }),
            pdpte: Some(EntryLocation { address: 0x20, value: 0x21 }),
            pde: None,
            pte: None,
        };
        let mut packet = PtePacket::new_zeroed();
        packet.fill(&query);
        assert_eq!({ packet.pdpte_value }, 0x21);
        assert_eq!({ packet.pde_address }, 0);
    }
}
