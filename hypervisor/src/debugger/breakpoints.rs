//! Debugger breakpoints (`bp`).
//!
//! Unlike hidden hooks these patch guest memory itself with `int3`. A hit restores the original
//! byte, runs the instruction once under MTF and writes `int3` back on the MTF exit, so a
//! breakpoint counts one hit per execution even when the thread that reaches it is filtered out.

use {
    crate::{
        debugger::{
            events::{trigger, EventStage, EventType, APPLY_TO_ALL},
            session::{self, PausingReason},
        },
        error::HypervisorError,
        intel::{events::EventInjection, vcpu::Interception, vmexit::VmExitContext},
        memory::mapper,
        platform::Platform,
        CoreState,
    },
    alloc::{collections::BTreeMap, vec::Vec},
    core::sync::atomic::{AtomicU64, Ordering},
    spin::Mutex,
};

const INT3: u8 = 0xCC;

/// Vector of #BP in the exception bitmap.
const BREAKPOINT_VECTOR: u8 = 3;

/// A `bp` request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub address: u64,
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    pub remove_after_hit: bool,
    /// Give `ExceptionOccurred` events for #BP a chance to consume the hit before halting.
    pub check_for_callbacks: bool,
}

impl BreakpointRequest {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            pid: APPLY_TO_ALL,
            tid: APPLY_TO_ALL,
            core: APPLY_TO_ALL,
            remove_after_hit: false,
            check_for_callbacks: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: u64,
    pub address: u64,
    pub pa: u64,
    pub cr3: u64,
    pub original: u8,
    pub pid: u32,
    pub tid: u32,
    pub core: u32,
    pub enabled: bool,
    pub remove_after_hit: bool,
    pub check_for_callbacks: bool,
    pub hit_count: u64,
}

impl Breakpoint {
    fn matches(&self, pid: u32, tid: u32, core: u32) -> bool {
        let accepts = |filter: u32, value: u32| filter == APPLY_TO_ALL || filter == value;
        accepts(self.pid, pid) && accepts(self.tid, tid) && accepts(self.core, core)
    }
}

/// `ListOrModifyBreakpoints` requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointModification {
    List,
    Enable(u64),
    Disable(u64),
    Clear(u64),
}

/// Breakpoints keyed by physical address.
#[derive(Default)]
pub struct BreakpointManager {
    breakpoints: Mutex<BTreeMap<u64, Breakpoint>>,
    next_id: AtomicU64,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().values().copied().collect()
    }

    pub fn find(&self, id: u64) -> Option<Breakpoint> {
        self.breakpoints.lock().values().find(|breakpoint| breakpoint.id == id).copied()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Places a breakpoint at `request.address` in the address space `cr3`. Returns its id.
///
/// # Arguments
///
/// * `platform` - The calling processor's platform.
/// * `state` - Breakpoint table and interception counts.
/// * `cr3` - Address space the address belongs to.
/// * `request` - Address and filters.
pub fn set(platform: &dyn Platform, state: &CoreState, cr3: u64, request: BreakpointRequest) -> Result<u64, HypervisorError> {
    let pa = mapper::virtual_to_physical(platform, cr3, request.address)?;

    let mut breakpoints = state.breakpoints.breakpoints.lock();
    if breakpoints.contains_key(&pa) {
        return Err(HypervisorError::BreakpointAlreadyExists);
    }

    let mut original = [0u8; 1];
    mapper::read_physical(platform, pa, &mut original)?;
    state.resources.acquire_on(platform, None, Interception::Exception(Some(BREAKPOINT_VECTOR)))?;
    if let Err(error) = mapper::write_physical(platform, pa, &[INT3]) {
        state.resources.release_on(platform, None, Interception::Exception(Some(BREAKPOINT_VECTOR)));
        return Err(error);
    }

    let id = state.breakpoints.next_id.fetch_add(1, Ordering::Relaxed);
    breakpoints.insert(
        pa,
        Breakpoint {
            id,
            address: request.address,
            pa,
            cr3,
            original: original[0],
            pid: request.pid,
            tid: request.tid,
            core: request.core,
            enabled: true,
            remove_after_hit: request.remove_after_hit,
            check_for_callbacks: request.check_for_callbacks,
            hit_count: 0,
        },
    );

    log::info!("Breakpoint {} at {:#x} (pa {:#x})", id, request.address, pa);
    Ok(id)
}

/// Lists, enables, disables or clears breakpoints. Returns the table after the change.
pub fn modify(platform: &dyn Platform, state: &CoreState, modification: BreakpointModification) -> Result<Vec<Breakpoint>, HypervisorError> {
    let id = match modification {
        BreakpointModification::List => return Ok(state.breakpoints.list()),
        BreakpointModification::Enable(id) | BreakpointModification::Disable(id) | BreakpointModification::Clear(id) => id,
    };

    {
        let mut breakpoints = state.breakpoints.breakpoints.lock();
        let pa = breakpoints
            .values()
            .find(|breakpoint| breakpoint.id == id)
            .map(|breakpoint| breakpoint.pa)
            .ok_or(HypervisorError::BreakpointNotFound)?;

        match modification {
            BreakpointModification::Enable(_) => {
                if let Some(breakpoint) = breakpoints.get_mut(&pa) {
                    mapper::write_physical(platform, pa, &[INT3])?;
                    breakpoint.enabled = true;
                }
            }
            BreakpointModification::Disable(_) => {
                if let Some(breakpoint) = breakpoints.get_mut(&pa) {
                    mapper::write_physical(platform, pa, &[breakpoint.original])?;
                    breakpoint.enabled = false;
                }
            }
            _ => {
                if let Some(breakpoint) = breakpoints.remove(&pa) {
                    remove(platform, state, &breakpoint);
                }
            }
        }
    }

    log::debug!("{:?}", modification);
    Ok(state.breakpoints.list())
}

/// Removes every breakpoint.
pub fn clear_all(platform: &dyn Platform, state: &CoreState) {
    let removed = core::mem::take(&mut *state.breakpoints.breakpoints.lock());
    for breakpoint in removed.values() {
        remove(platform, state, breakpoint);
    }
}

fn remove(platform: &dyn Platform, state: &CoreState, breakpoint: &Breakpoint) {
    if let Err(error) = mapper::write_physical(platform, breakpoint.pa, &[breakpoint.original]) {
        log::error!("Could not restore the byte under breakpoint {}: {}", breakpoint.id, error);
    }
    state.resources.release_on(platform, None, Interception::Exception(Some(BREAKPOINT_VECTOR)));
}

/// Handles a #BP on a debugger breakpoint. Returns false when the `int3` is not ours and the
/// exception belongs to the guest.
pub fn handle_breakpoint(ctx: &mut VmExitContext<'_>) -> bool {
    let rip = ctx.registers.rip;
    let Ok(pa) = mapper::virtual_to_physical(ctx.platform, ctx.guest_cr3(), rip) else {
        return false;
    };

    let info = ctx.platform.process_info();
    let core = ctx.core();

    let hit = {
        let mut breakpoints = ctx.state.breakpoints.breakpoints.lock();
        let Some(breakpoint) = breakpoints.get_mut(&pa).filter(|breakpoint| breakpoint.enabled) else {
            return false;
        };

        if let Err(error) = mapper::write_physical(ctx.platform, pa, &[breakpoint.original]) {
            log::error!("Could not restore the byte under breakpoint {}: {}", breakpoint.id, error);
        }

        let matched = breakpoint.matches(info.pid, info.tid, core);
        if matched {
            breakpoint.hit_count += 1;
        }

        let hit = *breakpoint;
        if matched && hit.remove_after_hit {
            breakpoints.remove(&pa);
        }
        hit
    };

    ctx.vcpu.suppress_rip_increment();

    let removed = hit.remove_after_hit && hit.matches(info.pid, info.tid, core);
    if removed {
        ctx.state.resources.release_on(ctx.platform, None, Interception::Exception(Some(BREAKPOINT_VECTOR)));
    } else {
        step_over_original(ctx, pa);
    }

    if !hit.matches(info.pid, info.tid, core) {
        log::trace!("Breakpoint {} passed by {}:{} on processor {}", hit.id, info.pid, info.tid, core);
        return true;
    }

    if hit.check_for_callbacks {
        let vector = u64::from(BREAKPOINT_VECTOR);
        let outcome = trigger::trigger_events(ctx, EventType::ExceptionOccurred, EventStage::Pre, vector, &|event| event.matches_param(vector));
        if outcome.short_circuit {
            return true;
        }
    }

    session::halt(ctx, PausingReason::SoftwareBreakpointHit, 0, rip);
    true
}

/// Lets the guest run the original instruction once with interrupts held, then re-arm.
fn step_over_original(ctx: &mut VmExitContext<'_>, pa: u64) {
    ctx.vcpu.pending_breakpoint_rearm = Some(pa);
    // An event delivered on this entry stops MTF before the original instruction runs.
    ctx.vcpu.mtf.ignore_one_mtf = EventInjection::is_pending(ctx.platform);
    let counts = ctx.state.resources.counts(ctx.core());
    ctx.vcpu.hold_interrupts(ctx.platform, &counts);
    ctx.vcpu.set_monitor_trap_flag(ctx.platform, true);
}

/// Writes `int3` back after the original instruction ran. Called on the MTF exit.
pub fn rearm(ctx: &mut VmExitContext<'_>) {
    let Some(pa) = ctx.vcpu.pending_breakpoint_rearm.take() else {
        return;
    };

    if ctx.state.breakpoints.breakpoints.lock().get(&pa).is_some_and(|breakpoint| breakpoint.enabled) {
        if let Err(error) = mapper::write_physical(ctx.platform, pa, &[INT3]) {
            log::error!("Could not re-arm breakpoint at pa {:#x}: {}", pa, error);
        }
    }

    if ctx.vcpu.step.is_none() {
        let counts = ctx.state.resources.counts(ctx.core());
        ctx.vcpu.release_interrupts(ctx.platform, &counts);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::{events::tests::setup, session::tests::RecordingHandler},
            intel::{registers::GuestRegisters, vcpu::VcpuState},
            platform::{mock::MockPlatform, ProcessInfo},
        },
        alloc::sync::Arc,
        x86::vmx::vmcs::guest,
    };

    const CODE: [u8; 4] = [0x48, 0x89, 0xC8, 0xC3];

    fn with_code() -> (MockPlatform, CoreState, u64, Arc<RecordingHandler>) {
        let (platform, state) = setup(2);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x2000, &CODE)[0];
        platform.set_vmcs(guest::CR3, cr3);
        let handler = Arc::new(RecordingHandler::default());
        state.session.set_handler(Some(handler.clone()));
        (platform, state, pa, handler)
    }

    #[test]
    fn test_hit_halts_and_rearms_after_step() {
        let (platform, state, pa, handler) = with_code();
        let cr3 = platform.vmcs(guest::CR3);
        let id = set(&platform, &state, cr3, BreakpointRequest::new(0x2000)).unwrap();
        assert_eq!(platform.read_memory(pa, 1), [INT3]);
        assert_eq!(state.resources.count(1, Interception::Exception(Some(3))), 1);
        assert_eq!(set(&platform, &state, cr3, BreakpointRequest::new(0x2000)), Err(HypervisorError::BreakpointAlreadyExists));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x2000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_breakpoint(&mut ctx));
        assert_eq!(handler.halts.lock()[0].reason, PausingReason::SoftwareBreakpointHit);
        assert_eq!(handler.halts.lock()[0].context, 0x2000);
        assert_eq!(platform.read_memory(pa, 1), [0x48]);
        assert_eq!(ctx.vcpu.pending_breakpoint_rearm, Some(pa));

        rearm(&mut ctx);
        assert_eq!(platform.read_memory(pa, 1), [INT3]);
        assert!(!ctx.vcpu.hold_interrupts);
        assert_eq!(state.breakpoints.find(id).unwrap().hit_count, 1);
    }

    #[test]
    fn test_filtered_out_thread_passes_without_halting() {
        let (platform, state, pa, handler) = with_code();
        let mut request = BreakpointRequest::new(0x2000);
        request.pid = 1234;
        let id = set(&platform, &state, platform.vmcs(guest::CR3), request).unwrap();

        platform.set_process(ProcessInfo { pid: 4, tid: 8, ..Default::default() });
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x2000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_breakpoint(&mut ctx));
        assert!(handler.halts.lock().is_empty());
        assert!(ctx.vcpu.hold_interrupts);
        rearm(&mut ctx);
        assert_eq!(platform.read_memory(pa, 1), [INT3]);
        assert_eq!(state.breakpoints.find(id).unwrap().hit_count, 0);
    }

    #[test]
    fn test_list_disable_and_clear() {
        let (platform, state, pa, _) = with_code();
        let id = set(&platform, &state, platform.vmcs(guest::CR3), BreakpointRequest::new(0x2001)).unwrap();

        let listed = modify(&platform, &state, BreakpointModification::Disable(id)).unwrap();
        assert!(!listed[0].enabled);
        assert_eq!(platform.read_memory(pa + 1, 1), [0x89]);

        // A disabled breakpoint's #BP is the guest's.
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x2001, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        assert!(!handle_breakpoint(&mut ctx));

        modify(&platform, &state, BreakpointModification::Enable(id)).unwrap();
        assert_eq!(platform.read_memory(pa + 1, 1), [INT3]);

        assert!(modify(&platform, &state, BreakpointModification::Clear(id)).unwrap().is_empty());
        assert_eq!(platform.read_memory(pa + 1, 1), [0x89]);
        assert_eq!(state.resources.count(0, Interception::Exception(Some(3))), 0);
        assert_eq!(modify(&platform, &state, BreakpointModification::Clear(id)), Err(HypervisorError::BreakpointNotFound));
    }

    #[test]
    fn test_remove_after_hit() {
        let (platform, state, pa, handler) = with_code();
        let mut request = BreakpointRequest::new(0x2000);
        request.remove_after_hit = true;
        set(&platform, &state, platform.vmcs(guest::CR3), request).unwrap();

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x2000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_breakpoint(&mut ctx));
        assert_eq!(handler.halts.lock().len(), 1);
        assert!(state.breakpoints.is_empty());
        assert_eq!(ctx.vcpu.pending_breakpoint_rearm, None);
        assert_eq!(platform.read_memory(pa, 1), [0x48]);
    }
}
