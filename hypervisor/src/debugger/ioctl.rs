//! The local device interface.
//!
//! A user-mode client on the debuggee itself talks to the driver through device I/O control
//! requests. Every request runs at passive level on whatever processor the client's thread is
//! on, with the system running. Payloads share their layouts with the serial protocol.

use {
    crate::{
        debugger::{
            events,
            hooks,
            kd::{commands::*, packet::RequestedAction, requests},
            session::{self, SwitchTarget},
            transparency,
        },
        error::{status_of, DebuggerErrorCode, HypervisorError},
        memory::pool::PoolIntention,
        platform::Platform,
        CoreState,
    },
    alloc::vec::Vec,
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// First function number available to drivers.
const FUNCTION_BASE: u32 = 0x800;

/// Builds an I/O control code the way the `CTL_CODE` macro does.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn code(index: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, FUNCTION_BASE + index, METHOD_BUFFERED, FILE_ANY_ACCESS)
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCode {
    RegisterEvent = code(0),
    AddActionToEvent = code(1),
    ModifyEvent = code(2),
    TerminateEvent = code(3),
    LoadEvents = code(4),
    ReadMemory = code(5),
    WriteMemory = code(6),
    ReadRegister = code(7),
    WriteMsr = code(8),
    Va2Pa = code(9),
    QueryPte = code(10),
    ReservePreAllocatedPools = code(11),
    InstallHook = code(12),
    RemoveHook = code(13),
    HideAndUnhide = code(14),
    SwitchCore = code(15),
    SwitchProcess = code(16),
    SwitchThread = code(17),
    PreactivateFunctionality = code(18),
    SendUsermodeMessagesToDebugger = code(19),
    ReadKernelLog = code(20),
    SymbolReload = code(21),
    PerformKernelSideTest = code(22),
    RunVmcall = code(23),
    PcieEndpointEnum = code(24),
    PerformSmiOperation = code(25),
}

impl IoctlCode {
    const ALL: [IoctlCode; 26] = [
        IoctlCode::RegisterEvent,
        IoctlCode::AddActionToEvent,
        IoctlCode::ModifyEvent,
        IoctlCode::TerminateEvent,
        IoctlCode::LoadEvents,
        IoctlCode::ReadMemory,
        IoctlCode::WriteMemory,
        IoctlCode::ReadRegister,
        IoctlCode::WriteMsr,
        IoctlCode::Va2Pa,
        IoctlCode::QueryPte,
        IoctlCode::ReservePreAllocatedPools,
        IoctlCode::InstallHook,
        IoctlCode::RemoveHook,
        IoctlCode::HideAndUnhide,
        IoctlCode::SwitchCore,
        IoctlCode::SwitchProcess,
        IoctlCode::SwitchThread,
        IoctlCode::PreactivateFunctionality,
        IoctlCode::SendUsermodeMessagesToDebugger,
        IoctlCode::ReadKernelLog,
        IoctlCode::SymbolReload,
        IoctlCode::PerformKernelSideTest,
        IoctlCode::RunVmcall,
        IoctlCode::PcieEndpointEnum,
        IoctlCode::PerformSmiOperation,
    ];

    pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
        Self::ALL.into_iter().find(|code| *code as u32 == value).ok_or(HypervisorError::ProtocolMismatch)
    }
}

/// `ReadRegister` numbers: debug registers are 0..=7, control registers `CONTROL_REGISTER | n`.
pub const CONTROL_REGISTER: u32 = 0x100;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct RegisterPacket {
    pub register: u32,
    pub value: u64,
    pub status: u32,
}

/// Reads or writes an MSR on the calling processor.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct MsrPacket {
    pub msr: u32,
    pub value: u64,
    pub is_write: u8,
    pub status: u32,
}

/// `LoadEvents` request: `count` events, each a [`RegisterEventPacket`] and its condition. The
/// reply is this header followed by one tag per registered event.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct LoadEventsPacket {
    pub count: u32,
    pub status: u32,
}

pub const INTENTION_HOOK_RECORD: u32 = 0;
pub const INTENTION_SPLIT_TABLE: u32 = 1;
pub const INTENTION_SHADOW_PAGE: u32 = 2;
pub const INTENTION_EVENT_BUFFER: u32 = 3;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct PoolPacket {
    pub intention: u32,
    pub size: u32,
    pub count: u32,
    pub status: u32,
}

pub const HOOK_BREAKPOINT: u8 = 0;
pub const HOOK_DETOUR: u8 = 1;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct HookPacket {
    pub address: u64,
    pub pid: u32,
    pub kind: u8,
    /// Event triggered by the hook.
    pub tag: u64,
    pub status: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct HidePacket {
    pub hide: u8,
    pub status: u32,
}

/// Reserves what a later registration from VMX root would otherwise have to allocate.
pub const PREACTIVATE_MODE_TRAP: u32 = 0;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct PreactivatePacket {
    pub functionality: u32,
    pub status: u32,
}

/// `ReadKernelLog` reply header. Followed by `count` records, each a [`LogRecord`] and its text.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct KernelLogPacket {
    pub max_messages: u32,
    pub count: u32,
    pub dropped: u64,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct LogRecord {
    pub tag: u64,
    pub immediate: u8,
    pub length: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Default, Clone, Copy)]
pub struct VmcallPacket {
    pub code: u64,
    pub params: [u64; 3],
    pub result: u64,
}

/// Serves one device request.
///
/// # Arguments
///
/// * `platform` - The calling processor, outside VMX root.
/// * `state` - The engine state.
/// * `code` - The I/O control code.
/// * `input` - The client's input buffer.
///
/// # Returns
///
/// The bytes for the client's output buffer.
pub fn dispatch(platform: &dyn Platform, state: &CoreState, code: u32, input: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let code = IoctlCode::from_u32(code)?;
    log::debug!("IOCTL {:?}", code);

    let current_cr3 = platform.read_cr(3);
    let shared = |action: RequestedAction| {
        requests::execute(platform, state, current_cr3, action, input).unwrap_or(Err(HypervisorError::ProtocolMismatch))
    };

    match code {
        IoctlCode::RegisterEvent => shared(RequestedAction::RegisterEvent),
        IoctlCode::AddActionToEvent => shared(RequestedAction::AddActionToEvent),
        IoctlCode::ModifyEvent => shared(RequestedAction::QueryAndModifyEvent),
        IoctlCode::TerminateEvent => {
            let (mut request, _) = split::<ModifyEventPacket>(input)?;
            request.status = status_of(&events::terminate_event(platform, state, request.tag));
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::LoadEvents => load_events(platform, state, input),
        IoctlCode::ReadMemory => shared(RequestedAction::ReadMemory),
        IoctlCode::WriteMemory => shared(RequestedAction::EditMemory),
        IoctlCode::ReadRegister => {
            let (mut request, _) = split::<RegisterPacket>(input)?;
            request.status = DebuggerErrorCode::Success as u32;
            request.value = match { request.register } {
                dr @ 0..=7 => platform.read_dr(dr as u8),
                cr if cr & !0xF == CONTROL_REGISTER && matches!(cr & 0xF, 0 | 2 | 3 | 4 | 8) => platform.read_cr((cr & 0xF) as u8),
                _ => {
                    request.status = DebuggerErrorCode::InvalidRegisterNumber as u32;
                    0
                }
            };
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::WriteMsr => {
            let (mut request, _) = split::<MsrPacket>(input)?;
            let succeeded = match request.is_write {
                0 => match platform.rdmsr(request.msr) {
                    Some(value) => {
                        request.value = value;
                        true
                    }
                    None => false,
                },
                _ => platform.wrmsr(request.msr, request.value),
            };
            request.status = match succeeded {
                true => DebuggerErrorCode::Success as u32,
                false => DebuggerErrorCode::InvalidRegisterNumber as u32,
            };
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::Va2Pa => shared(RequestedAction::Va2PaPa2Va),
        IoctlCode::QueryPte => shared(RequestedAction::QueryPte),
        IoctlCode::ReservePreAllocatedPools => {
            let (mut request, _) = split::<PoolPacket>(input)?;
            let (size, count) = (request.size as usize, request.count as usize);
            let result = intention(request.intention).and_then(|intention| state.pool.reserve(platform, size, count, intention));
            request.status = status_of(&result);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::InstallHook => {
            let (mut request, _) = split::<HookPacket>(input)?;
            let (address, tag, kind) = (request.address, request.tag, request.kind);
            let result = requests::address_space(platform, request.pid, current_cr3).and_then(|cr3| match kind {
                HOOK_BREAKPOINT => hooks::install_cc_hook(platform, state, cr3, address, tag),
                HOOK_DETOUR => hooks::install_detour_hook(platform, state, cr3, address, tag),
                _ => Err(HypervisorError::BadEventDescriptor),
            });
            request.status = status_of(&result);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::RemoveHook => {
            let (mut request, _) = split::<HookPacket>(input)?;
            let address = request.address;
            let result = requests::address_space(platform, request.pid, current_cr3).and_then(|cr3| hooks::remove_hook_at(platform, state, cr3, address));
            request.status = status_of(&result);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::HideAndUnhide => {
            let (mut request, _) = split::<HidePacket>(input)?;
            let result = match request.hide {
                0 => state.transparency.unhide(platform, &state.resources),
                _ => state.transparency.hide(platform, &state.resources, transparency::measure_profile(platform)),
            };
            request.status = status_of(&result);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::SwitchCore => {
            let (mut request, _) = split::<ChangeCorePacket>(input)?;
            request.status = match request.core < platform.processor_count() {
                true => DebuggerErrorCode::Success as u32,
                false => DebuggerErrorCode::InvalidCoreId as u32,
            };
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::SwitchProcess | IoctlCode::SwitchThread => {
            let (mut request, _) = split::<ChangeContextPacket>(input)?;
            if request.switch == 0 {
                let process = platform.process_info();
                request.id = if code == IoctlCode::SwitchProcess { process.pid } else { process.tid };
                request.process = process.process;
                request.thread = process.thread;
                request.name = process.name;
                request.status = DebuggerErrorCode::Success as u32;
            } else {
                let target = match code {
                    IoctlCode::SwitchProcess => SwitchTarget::Process(request.id),
                    _ => SwitchTarget::Thread(request.id),
                };
                request.status = status_of(&session::request_switch(platform, state, target));
            }
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::PreactivateFunctionality => {
            let (mut request, _) = split::<PreactivatePacket>(input)?;
            let result = match request.functionality {
                PREACTIVATE_MODE_TRAP => {
                    let count = state.config.preallocated_pools as usize;
                    state.ept.lock().reserve_split_tables(count)
                }
                _ => Err(HypervisorError::BadEventDescriptor),
            };
            request.status = status_of(&result);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::SendUsermodeMessagesToDebugger => {
            let text = core::str::from_utf8(input).map_err(|_| HypervisorError::ProtocolMismatch)?;
            state.messages.push(0, true, text);
            Ok(StatusPacket { status: DebuggerErrorCode::Success as u32 }.as_bytes().to_vec())
        }
        IoctlCode::ReadKernelLog => read_kernel_log(state, input),
        IoctlCode::SymbolReload => {
            let modules = state.symbols.reload(platform);
            let reply = SymbolReloadPacket { module_count: modules as u32, symbol_count: 0, status: DebuggerErrorCode::Success as u32 };
            Ok(reply.as_bytes().to_vec())
        }
        IoctlCode::PerformKernelSideTest => shared(RequestedAction::TestQuery),
        IoctlCode::RunVmcall => {
            let (mut request, _) = split::<VmcallPacket>(input)?;
            request.result = platform.vmcall(request.code, request.params);
            Ok(request.as_bytes().to_vec())
        }
        IoctlCode::PcieEndpointEnum | IoctlCode::PerformSmiOperation => Err(HypervisorError::UnsupportedProcessor),
    }
}

fn intention(value: u32) -> Result<PoolIntention, HypervisorError> {
    match value {
        INTENTION_HOOK_RECORD => Ok(PoolIntention::HookRecord),
        INTENTION_SPLIT_TABLE => Ok(PoolIntention::SplitTable),
        INTENTION_SHADOW_PAGE => Ok(PoolIntention::ShadowPage),
        INTENTION_EVENT_BUFFER => Ok(PoolIntention::EventBuffer),
        _ => Err(HypervisorError::BadEventDescriptor),
    }
}

/// Registers a batch of events in order, stopping at the first failure.
fn load_events(platform: &dyn Platform, state: &CoreState, input: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut header, mut rest) = split::<LoadEventsPacket>(input)?;
    let mut tags: Vec<u64> = Vec::new();
    let mut result = Ok(());

    for _ in 0..header.count {
        let (event, tail) = split::<RegisterEventPacket>(rest)?;
        let condition_length = event.condition_length as usize;
        let registered = event.descriptor(tail).and_then(|descriptor| events::register_event(platform, state, descriptor, Vec::new()));

        match registered {
            Ok(tag) => tags.push(tag),
            Err(error) => {
                result = Err(error);
                break;
            }
        }
        rest = &tail[condition_length..];
    }

    log::info!("Loaded {} of {} events", tags.len(), { header.count });
    header.count = tags.len() as u32;
    header.status = status_of(&result);
    Ok(join(&header, tags.as_bytes()))
}

fn read_kernel_log(state: &CoreState, input: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut header, _) = split::<KernelLogPacket>(input)?;
    let messages = state.messages.drain(header.max_messages.max(1) as usize);

    let mut records = Vec::new();
    for message in &messages {
        let record = LogRecord { tag: message.tag, immediate: u8::from(message.immediate), length: message.text.len() as u32 };
        records.extend_from_slice(record.as_bytes());
        records.extend_from_slice(message.text.as_bytes());
    }

    header.count = messages.len() as u32;
    header.dropped = state.messages.dropped();
    Ok(join(&header, &records))
}
