//! Requests that need no particular processor.
//!
//! Both the serial protocol (while the system is halted) and the IOCTL surface (at passive level)
//! serve these the same way, so they only see the platform, the engine state and the address
//! space of whoever is asking.

use {
    crate::{
        debugger::{
            breakpoints::{self, BreakpointModification, BreakpointRequest},
            callstack,
            events::{self, ModifyAction, APPLY_TO_ALL},
            kd::{commands::*, packet::RequestedAction},
            symbols::{ModuleSymbolDetail, SymbolRecord},
        },
        error::{status_of, DebuggerErrorCode, HypervisorError},
        memory::mapper,
        platform::Platform,
        CoreState,
    },
    alloc::{vec, vec::Vec},
    zerocopy::{FromBytes, IntoBytes},
};

/// Largest read served in one request.
pub const MAX_READ_SIZE: u32 = 0x8000;

/// Largest number of addresses a search returns.
pub const MAX_SEARCH_RESULTS: u32 = 0x1000;

/// Address space a request names: `pid` or, for `APPLY_TO_ALL`, the requester's own.
pub(crate) fn address_space(platform: &dyn Platform, pid: u32, current_cr3: u64) -> Result<u64, HypervisorError> {
    match pid {
        APPLY_TO_ALL => Ok(current_cr3),
        pid => mapper::cr3_of(platform, Some(pid)),
    }
}

/// Serves `action` if it is one of the shared requests.
///
/// # Arguments
///
/// * `platform` - The platform of the serving processor.
/// * `state` - The engine state.
/// * `current_cr3` - Address space used when a request names no process.
/// * `action` - The request.
/// * `payload` - The request payload.
///
/// # Returns
///
/// The reply payload, or `None` when `action` is not a shared request.
pub fn execute(
    platform: &dyn Platform,
    state: &CoreState,
    current_cr3: u64,
    action: RequestedAction,
    payload: &[u8],
) -> Option<Result<Vec<u8>, HypervisorError>> {
    let reply = match action {
        RequestedAction::ReadMemory => read_memory(platform, current_cr3, payload),
        RequestedAction::EditMemory => edit_memory(platform, current_cr3, payload),
        RequestedAction::SearchMemory => search_memory(platform, current_cr3, payload),
        RequestedAction::Va2PaPa2Va => convert_address(platform, current_cr3, payload),
        RequestedAction::QueryPte => query_pte(platform, current_cr3, payload),
        RequestedAction::RegisterEvent => register_event(platform, state, payload),
        RequestedAction::AddActionToEvent => add_action(platform, state, payload),
        RequestedAction::QueryAndModifyEvent => modify_event(platform, state, payload),
        RequestedAction::Bp => set_breakpoint(platform, state, current_cr3, payload),
        RequestedAction::ListOrModifyBreakpoints => modify_breakpoints(platform, state, payload),
        RequestedAction::Callstack => walk_callstack(platform, current_cr3, payload),
        RequestedAction::TestQuery => test_query(state, payload),
        RequestedAction::SymbolReload => symbol_reload(state, payload),
        RequestedAction::FlushBuffers => Ok(flush(state)),
        RequestedAction::QueryVersion => Ok(version()),
        _ => return None,
    };
    Some(reply)
}

fn read_memory(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<ReadMemoryPacket>(payload)?;
    let size = request.size.min(MAX_READ_SIZE);
    let address = request.address;
    let mut buffer = vec![0u8; size as usize];

    let result = match MemoryType::from_u8(request.memory_type)? {
        MemoryType::Physical => mapper::read_physical(platform, address, &mut buffer),
        MemoryType::Virtual => {
            address_space(platform, request.pid, current_cr3).and_then(|cr3| mapper::read_virtual(platform, cr3, address, &mut buffer))
        }
    };

    request.status = status_of(&result);
    request.size = if result.is_ok() { size } else { 0 };
    Ok(join(&request, if result.is_ok() { &buffer } else { &[] }))
}

fn edit_memory(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, tail) = split::<EditMemoryPacket>(payload)?;
    let address = request.address;
    let data = tail.get(..request.size as usize).ok_or(HypervisorError::ProtocolMismatch)?;

    let result = match MemoryType::from_u8(request.memory_type)? {
        MemoryType::Physical => mapper::write_physical(platform, address, data),
        MemoryType::Virtual => {
            address_space(platform, request.pid, current_cr3).and_then(|cr3| mapper::write_virtual(platform, cr3, address, data))
        }
    };

    request.status = status_of(&result);
    Ok(request.as_bytes().to_vec())
}

fn search_memory(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, pattern) = split::<SearchMemoryPacket>(payload)?;
    let limit = request.max_results.clamp(1, MAX_SEARCH_RESULTS) as usize;

    let (start, length) = (request.address, request.length);
    let found = address_space(platform, request.pid, current_cr3).map(|cr3| mapper::search(platform, cr3, start, length, pattern, limit));

    request.status = status_of(&found);
    let found = found.unwrap_or_default();
    request.count = found.len() as u32;
    Ok(join(&request, found.as_bytes()))
}

fn convert_address(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<AddressConversionPacket>(payload)?;

    let (va, pa) = (request.virtual_address, request.physical_address);

    let result = if request.is_virtual_to_physical != 0 {
        address_space(platform, request.pid, current_cr3).and_then(|cr3| mapper::virtual_to_physical(platform, cr3, va))
    } else {
        mapper::physical_to_virtual(platform, pa)
    };

    match (request.is_virtual_to_physical != 0, result) {
        (true, Ok(pa)) => request.physical_address = pa,
        (false, Ok(va)) => request.virtual_address = va,
        _ => {}
    }

    request.status = status_of(&result);
    Ok(request.as_bytes().to_vec())
}

fn query_pte(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<PtePacket>(payload)?;

    let va = request.va;
    let result = address_space(platform, request.pid, current_cr3).map(|cr3| mapper::query_pte(platform, cr3, va));
    request.status = status_of(&result);
    if let Ok(query) = result {
        request.fill(&query);
    }

    Ok(request.as_bytes().to_vec())
}

fn register_event(platform: &dyn Platform, state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, tail) = split::<RegisterEventPacket>(payload)?;

    let result = request.descriptor(tail).and_then(|descriptor| events::register_event(platform, state, descriptor, Vec::new()));
    request.status = status_of(&result);
    request.tag = result.unwrap_or(0);
    Ok(request.as_bytes().to_vec())
}

fn add_action(platform: &dyn Platform, state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, tail) = split::<AddActionPacket>(payload)?;

    let tag = request.tag;
    let result = request.descriptor(tail).and_then(|descriptor| events::add_action(platform, state, tag, descriptor));
    request.status = match result {
        Err(HypervisorError::BadEventDescriptor) if request.action_type > ACTION_RUN_CUSTOM_CODE => DebuggerErrorCode::InvalidActionType as u32,
        _ => status_of(&result),
    };
    Ok(request.as_bytes().to_vec())
}

fn modify_event(platform: &dyn Platform, state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<ModifyEventPacket>(payload)?;

    let result = match ModifyAction::from_u32(request.action) {
        Ok(action) => events::modify_event(platform, state, request.tag, action),
        Err(_) => {
            request.status = DebuggerErrorCode::ModifyEventsInvalidTypeOfAction as u32;
            return Ok(request.as_bytes().to_vec());
        }
    };

    request.status = status_of(&result);
    request.is_enabled = u8::from(result.unwrap_or(false));
    Ok(request.as_bytes().to_vec())
}

fn set_breakpoint(platform: &dyn Platform, state: &CoreState, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<BpPacket>(payload)?;

    let breakpoint = BreakpointRequest {
        address: request.address,
        pid: request.pid,
        tid: request.tid,
        core: request.core,
        remove_after_hit: request.remove_after_hit != 0,
        check_for_callbacks: request.check_for_callbacks != 0,
    };

    if request.core != APPLY_TO_ALL && request.core >= platform.processor_count() {
        request.status = DebuggerErrorCode::InvalidCoreId as u32;
        return Ok(request.as_bytes().to_vec());
    }

    let result = address_space(platform, request.pid, current_cr3).and_then(|cr3| breakpoints::set(platform, state, cr3, breakpoint));

    request.status = status_of(&result);
    request.id = result.unwrap_or(0);
    Ok(request.as_bytes().to_vec())
}

fn modify_breakpoints(platform: &dyn Platform, state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<ModifyBreakpointPacket>(payload)?;

    let modification = match request.request {
        BREAKPOINT_LIST => BreakpointModification::List,
        BREAKPOINT_ENABLE => BreakpointModification::Enable(request.id),
        BREAKPOINT_DISABLE => BreakpointModification::Disable(request.id),
        BREAKPOINT_CLEAR => BreakpointModification::Clear(request.id),
        _ => return Err(HypervisorError::ProtocolMismatch),
    };

    let result = breakpoints::modify(platform, state, modification);
    request.status = status_of(&result);

    let entries: Vec<BreakpointEntry> = result
        .unwrap_or_default()
        .iter()
        .map(|breakpoint| BreakpointEntry {
            id: breakpoint.id,
            address: breakpoint.address,
            pa: breakpoint.pa,
            enabled: u8::from(breakpoint.enabled),
        })
        .collect();
    request.count = entries.len() as u32;
    Ok(join(&request, entries.as_bytes()))
}

fn walk_callstack(platform: &dyn Platform, current_cr3: u64, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<CallstackPacket>(payload)?;
    let is_32bit = request.is_32bit != 0;

    let result = callstack::walk(platform, current_cr3, request.base, request.size, is_32bit);
    request.status = status_of(&result);

    let frames: Vec<CallstackFrameEntry> =
        result.unwrap_or_default().iter().map(|frame| CallstackFrameEntry::from_frame(frame, is_32bit)).collect();
    request.count = frames.len() as u32;
    Ok(join(&request, frames.as_bytes()))
}

/// Engine counters the test harness of the debugger checks after its scenarios.
fn test_query(state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, _) = split::<TestQueryPacket>(payload)?;

    request.status = DebuggerErrorCode::Success as u32;
    request.value = match request.option {
        TEST_QUERY_HALTED_CORES => state.session.halted_cores().len() as u64,
        TEST_QUERY_EVENT_COUNT => state.events.len() as u64,
        TEST_QUERY_BREAKPOINT_COUNT => state.breakpoints.len() as u64,
        TEST_QUERY_POOL_RETIRED => state.pool.retired() as u64,
        _ => {
            request.status = DebuggerErrorCode::InvalidActionType as u32;
            0
        }
    };

    Ok(request.as_bytes().to_vec())
}

fn symbol_reload(state: &CoreState, payload: &[u8]) -> Result<Vec<u8>, HypervisorError> {
    let (mut request, tail) = split::<SymbolReloadPacket>(payload)?;

    let (details, tail) = <[ModuleSymbolDetail]>::ref_from_prefix_with_elems(tail, request.module_count as usize)
        .map_err(|_| HypervisorError::ProtocolMismatch)?;
    let (records, _) = <[SymbolRecord]>::ref_from_prefix_with_elems(tail, request.symbol_count as usize)
        .map_err(|_| HypervisorError::ProtocolMismatch)?;

    state.symbols.update(details);
    let added = state.symbols.add_symbols(records);
    log::info!("Symbol table now has {} modules, {} new symbols", details.len(), added);

    request.status = DebuggerErrorCode::Success as u32;
    Ok(request.as_bytes().to_vec())
}

fn flush(state: &CoreState) -> Vec<u8> {
    let flushed = state.messages.flush();
    FlushPacket { flushed: flushed as u32, status: DebuggerErrorCode::Success as u32 }.as_bytes().to_vec()
}

fn version() -> Vec<u8> {
    let part = |text: &str| text.parse().unwrap_or(0);
    VersionPacket {
        protocol: PROTOCOL_VERSION,
        major: part(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: part(env!("CARGO_PKG_VERSION_MINOR")),
        patch: part(env!("CARGO_PKG_VERSION_PATCH")),
    }
    .as_bytes()
    .to_vec()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{debugger::events::tests::setup, debugger::events::EventType},
        zerocopy::FromZeros,
    };

    const CR3: u64 = 0x10_0000;

    #[test]
    fn test_read_and_edit_virtual_memory() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x7000_1000, &[1, 2, 3, 4]);

        let mut edit = EditMemoryPacket::new_zeroed();
        edit.address = 0x7000_1001;
        edit.size = 2;
        edit.pid = APPLY_TO_ALL;
        let reply = execute(&platform, &state, cr3, RequestedAction::EditMemory, &join(&edit, &[0xAA, 0xBB])).unwrap().unwrap();
        let (edited, _) = split::<EditMemoryPacket>(&reply).unwrap();
        assert_eq!({ edited.status }, DebuggerErrorCode::Success as u32);

        let mut read = ReadMemoryPacket::new_zeroed();
        read.address = 0x7000_1000;
        read.size = 4;
        read.pid = APPLY_TO_ALL;
        let reply = execute(&platform, &state, cr3, RequestedAction::ReadMemory, read.as_bytes()).unwrap().unwrap();
        let (header, bytes) = split::<ReadMemoryPacket>(&reply).unwrap();
        assert_eq!({ header.size }, 4);
        assert_eq!(bytes, [1, 0xAA, 0xBB, 4]);
    }

    #[test]
    fn test_read_of_unmapped_memory_reports_status() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();

        let mut read = ReadMemoryPacket::new_zeroed();
        read.address = 0xdead_0000;
        read.size = 8;
        read.pid = APPLY_TO_ALL;
        let reply = execute(&platform, &state, cr3, RequestedAction::ReadMemory, read.as_bytes()).unwrap().unwrap();
        let (header, bytes) = split::<ReadMemoryPacket>(&reply).unwrap();
        assert_ne!({ header.status }, DebuggerErrorCode::Success as u32);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_register_then_clear_event() {
        let (platform, state) = setup(2);

        let mut register = RegisterEventPacket::new_zeroed();
        register.event_type = EventType::CpuidInstructionExecution as u32;
        register.core = APPLY_TO_ALL;
        register.pid = APPLY_TO_ALL;
        register.tid = APPLY_TO_ALL;
        register.params[0] = u64::from(APPLY_TO_ALL);
        register.stage = 1;
        register.enabled = 1;
        let reply = execute(&platform, &state, CR3, RequestedAction::RegisterEvent, register.as_bytes()).unwrap().unwrap();
        let (registered, _) = split::<RegisterEventPacket>(&reply).unwrap();
        assert_eq!({ registered.status }, DebuggerErrorCode::Success as u32);
        assert_eq!(state.events.len(), 1);

        let modify = ModifyEventPacket { tag: registered.tag, action: ModifyAction::Clear as u32, is_enabled: 0, status: 0 };
        let reply = execute(&platform, &state, CR3, RequestedAction::QueryAndModifyEvent, modify.as_bytes()).unwrap().unwrap();
        let (modified, _) = split::<ModifyEventPacket>(&reply).unwrap();
        assert_eq!({ modified.status }, DebuggerErrorCode::Success as u32);
        assert!(state.events.is_empty());

        let reply = execute(&platform, &state, CR3, RequestedAction::QueryAndModifyEvent, modify.as_bytes()).unwrap().unwrap();
        let (modified, _) = split::<ModifyEventPacket>(&reply).unwrap();
        assert_eq!({ modified.status }, DebuggerErrorCode::TagNotExists as u32);
    }

    #[test]
    fn test_breakpoint_on_invalid_core() {
        let (platform, state) = setup(2);
        let mut request = BpPacket::new_zeroed();
        request.address = 0x7000_0000;
        request.pid = APPLY_TO_ALL;
        request.tid = APPLY_TO_ALL;
        request.core = 5;

        let reply = execute(&platform, &state, CR3, RequestedAction::Bp, request.as_bytes()).unwrap().unwrap();
        let (reply, _) = split::<BpPacket>(&reply).unwrap();
        assert_eq!({ reply.status }, DebuggerErrorCode::InvalidCoreId as u32);
        assert!(state.breakpoints.is_empty());
    }

    #[test]
    fn test_halted_requests_are_not_shared() {
        let (platform, state) = setup(1);
        assert!(execute(&platform, &state, CR3, RequestedAction::Continue, &[]).is_none());
        assert!(execute(&platform, &state, CR3, RequestedAction::ReadRegisters, &[]).is_none());
    }
}
