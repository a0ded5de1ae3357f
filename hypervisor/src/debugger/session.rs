//! Halting the system for the debugger.
//!
//! A processor that needs the debugger (an event with a break action, a breakpoint, a finished
//! step, a pause request) becomes the owner of the session, asks every other processor to exit
//! and hands control to the attached [`HaltHandler`]. The other processors park in VMX root at
//! the end of their current exit and stay there, servicing [`broadcast`] tasks, until the owner
//! continues or passes ownership to one of them.
//!
//! [`broadcast`]: crate::debugger::broadcast

use {
    crate::{
        debugger::broadcast::TaskSlots,
        error::HypervisorError,
        intel::{vcpu::Interception, vmexit::VmExitContext},
        platform::Platform,
        CoreState,
    },
    alloc::{sync::Arc, vec::Vec},
    core::sync::atomic::{AtomicBool, AtomicU32, Ordering},
    spin::{Mutex, RwLock},
};

pub const NO_OWNER: u32 = u32::MAX;

/// Why the debuggee stopped, in wire order.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PausingReason {
    NotPaused = 0,
    Pause,
    RequestFromDebugger,
    Stepped,
    TrackingStepped,
    SoftwareBreakpointHit,
    HardwareDebugRegisterHit,
    CoreSwitched,
    ProcessSwitched,
    ThreadSwitched,
    CommandExecutionFinished,
    EventTriggered,
    GeneralDebugBreak,
}

/// What the owner reports to the handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HaltInfo {
    pub reason: PausingReason,
    pub core: u32,
    /// Tag of the event that caused the halt, or 0.
    pub tag: u64,
    /// Event context, breakpoint address or step target.
    pub context: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltOutcome {
    /// Release every processor.
    Continue,
    /// Keep the system halted and continue serving from another processor.
    SwitchCore(u32),
}

/// The debugger side of a halt: the serial protocol or a local client.
pub trait HaltHandler: Send + Sync {
    /// Serves the debugger until it continues. Runs on the owning processor with every other
    /// processor parked.
    fn on_halt(&self, ctx: &mut VmExitContext<'_>, info: &HaltInfo) -> HaltOutcome;

    /// Polled at the end of every exit. Returning true halts the system with
    /// `RequestFromDebugger`.
    fn pause_requested(&self, _ctx: &VmExitContext<'_>) -> bool {
        false
    }
}

/// A pending `.process` or `.thread` switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwitchTarget {
    Process(u32),
    Thread(u32),
}

impl SwitchTarget {
    fn interception(self) -> Interception {
        match self {
            SwitchTarget::Process(_) => Interception::CrWrite(3),
            SwitchTarget::Thread(_) => Interception::ExternalInterruptExiting,
        }
    }
}

pub struct DebuggerSession {
    handler: RwLock<Option<Arc<dyn HaltHandler>>>,
    owner: AtomicU32,
    halt_requested: AtomicBool,
    halted: Vec<AtomicBool>,
    switch_to: AtomicU32,
    ignore_pause: AtomicBool,
    switch_target: Mutex<Option<SwitchTarget>>,
    tasks: TaskSlots,
}

impl DebuggerSession {
    pub fn new(processor_count: u32) -> Self {
        Self {
            handler: RwLock::new(None),
            owner: AtomicU32::new(NO_OWNER),
            halt_requested: AtomicBool::new(false),
            halted: (0..processor_count).map(|_| AtomicBool::new(false)).collect(),
            switch_to: AtomicU32::new(NO_OWNER),
            ignore_pause: AtomicBool::new(false),
            switch_target: Mutex::new(None),
            tasks: TaskSlots::new(processor_count),
        }
    }

    /// Attaches or detaches the debugger.
    pub fn set_handler(&self, handler: Option<Arc<dyn HaltHandler>>) {
        log::info!("Debugger {}", if handler.is_some() { "attached" } else { "detached" });
        *self.handler.write() = handler;
    }

    pub fn handler(&self) -> Option<Arc<dyn HaltHandler>> {
        self.handler.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Processor serving the debugger, if the system is halted.
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            core => Some(core),
        }
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested.load(Ordering::Acquire)
    }

    /// Whether `core` is parked or serving the debugger.
    pub fn is_halted(&self, core: u32) -> bool {
        self.halted.get(core as usize).is_some_and(|halted| halted.load(Ordering::Acquire))
    }

    pub fn halted_cores(&self) -> Vec<u32> {
        (0..self.halted.len() as u32).filter(|core| self.is_halted(*core)).collect()
    }

    pub fn tasks(&self) -> &TaskSlots {
        &self.tasks
    }

    /// Ignores pause requests from the debugger, used while a long command runs.
    pub fn set_ignore_pause(&self, ignore: bool) {
        self.ignore_pause.store(ignore, Ordering::Release);
    }

    pub fn switch_target(&self) -> Option<SwitchTarget> {
        *self.switch_target.lock()
    }

    fn set_halted(&self, core: u32, halted: bool) {
        if let Some(flag) = self.halted.get(core as usize) {
            flag.store(halted, Ordering::Release);
        }
    }

    fn release(&self) {
        self.halt_requested.store(false, Ordering::Release);
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

/// Halts the system and serves the debugger from the calling processor.
///
/// Returns once the debugger continues. Without an attached debugger the request is dropped.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `reason` - Reported to the debugger.
/// * `tag` - Tag of the triggering event, or 0.
/// * `context` - Event context or address reported with the halt.
pub fn halt(ctx: &mut VmExitContext<'_>, reason: PausingReason, tag: u64, context: u64) {
    let core = ctx.core();
    let Some(handler) = ctx.state.session.handler() else {
        log::warn!("{:?} on processor {} ignored, no debugger attached", reason, core);
        return;
    };

    loop {
        match ctx.state.session.owner.compare_exchange(NO_OWNER, core, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(owner) if owner == core => {
                log::debug!("{:?} on processor {} while it already serves the debugger", reason, core);
                return;
            }
            // Another processor won; wait for it to finish and retry.
            Err(_) => {
                park(ctx);
                core::hint::spin_loop();
            }
        }
    }

    log::debug!("Processor {} halting the system: {:?}", core, reason);

    let session = &ctx.state.session;
    session.halt_requested.store(true, Ordering::Release);
    session.set_halted(core, true);
    for other in (0..ctx.platform.processor_count()).filter(|other| *other != core) {
        ctx.state.resources.request_exit(ctx.platform, other);
    }

    let switched = serve(ctx, &handler, HaltInfo { reason, core, tag, context });
    if switched {
        park_halted(ctx);
    }

    ctx.state.session.set_halted(core, false);
}

/// Runs the handler until it continues. Returns true when ownership went to another processor.
fn serve(ctx: &mut VmExitContext<'_>, handler: &Arc<dyn HaltHandler>, info: HaltInfo) -> bool {
    let processor_count = ctx.platform.processor_count();

    loop {
        match handler.on_halt(ctx, &info) {
            HaltOutcome::Continue => {
                log::debug!("Processor {} continuing the system", info.core);
                ctx.state.session.release();
                return false;
            }
            HaltOutcome::SwitchCore(target) if target < processor_count && target != info.core => {
                log::info!("Switching debugger to processor {}", target);
                let session = &ctx.state.session;
                session.owner.store(target, Ordering::Release);
                session.switch_to.store(target, Ordering::Release);
                return true;
            }
            HaltOutcome::SwitchCore(target) => {
                log::warn!("Cannot switch to processor {}", target);
            }
        }
    }
}

/// Parks the calling processor while a halt is in effect.
pub fn park(ctx: &mut VmExitContext<'_>) {
    if !ctx.state.session.is_halt_requested() {
        return;
    }

    let core = ctx.core();
    ctx.state.session.set_halted(core, true);
    park_halted(ctx);
    ctx.state.session.set_halted(core, false);
}

fn park_halted(ctx: &mut VmExitContext<'_>) {
    let core = ctx.core();
    log::trace!("Processor {} parked", core);

    while ctx.state.session.is_halt_requested() {
        ctx.state.resources.apply(ctx.platform, ctx.vcpu);
        ctx.state.session.tasks.service(ctx);

        if ctx.state.session.switch_to.compare_exchange(core, NO_OWNER, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            match ctx.state.session.handler() {
                Some(handler) => {
                    let info = HaltInfo { reason: PausingReason::CoreSwitched, core, tag: 0, context: 0 };
                    serve(ctx, &handler, info);
                }
                None => ctx.state.session.release(),
            }
        }

        core::hint::spin_loop();
    }

    ctx.state.resources.apply(ctx.platform, ctx.vcpu);
    log::trace!("Processor {} released", core);
}

/// End-of-exit hook: parks for a pending halt or halts for a pause request of the debugger.
pub fn park_if_requested(ctx: &mut VmExitContext<'_>) {
    let session = &ctx.state.session;
    if session.is_halt_requested() {
        park(ctx);
        return;
    }

    if session.ignore_pause.load(Ordering::Acquire) {
        return;
    }

    if session.handler().is_some_and(|handler| handler.pause_requested(ctx)) {
        halt(ctx, PausingReason::RequestFromDebugger, 0, 0);
    }
}

/// Arms a switch to a process or thread. The system halts on the first processor that runs it.
pub fn request_switch(platform: &dyn Platform, state: &CoreState, target: SwitchTarget) -> Result<(), HypervisorError> {
    let mut pending = state.session.switch_target.lock();
    if let Some(previous) = pending.take() {
        state.resources.release_on(platform, None, previous.interception());
    }

    state.resources.acquire_on(platform, None, target.interception())?;
    *pending = Some(target);
    log::info!("Waiting for {:?}", target);
    Ok(())
}

/// Cancels a pending switch.
pub fn cancel_switch(platform: &dyn Platform, state: &CoreState) {
    if let Some(previous) = state.session.switch_target.lock().take() {
        state.resources.release_on(platform, None, previous.interception());
    }
}

/// Halts if the guest now runs the process or thread a switch waits for. Called after CR3 writes
/// and external interrupts.
pub fn check_switch(ctx: &mut VmExitContext<'_>) {
    let Some(target) = ctx.state.session.switch_target() else {
        return;
    };

    let info = ctx.platform.process_info();
    let (reached, reason) = match target {
        SwitchTarget::Process(pid) => (info.pid == pid, PausingReason::ProcessSwitched),
        SwitchTarget::Thread(tid) => (info.tid == tid, PausingReason::ThreadSwitched),
    };

    if !reached {
        return;
    }

    {
        let mut pending = ctx.state.session.switch_target.lock();
        if *pending != Some(target) {
            return;
        }
        *pending = None;
    }

    ctx.state.resources.release_on(ctx.platform, None, target.interception());
    halt(ctx, reason, 0, 0);
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            debugger::events::tests::setup,
            intel::{registers::GuestRegisters, vcpu::VcpuState},
            platform::ProcessInfo,
        },
    };

    /// Records every halt and continues.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub halts: Mutex<Vec<HaltInfo>>,
        pub pause: AtomicBool,
    }

    impl HaltHandler for RecordingHandler {
        fn on_halt(&self, ctx: &mut VmExitContext<'_>, info: &HaltInfo) -> HaltOutcome {
            assert_eq!(ctx.state.session.owner(), Some(info.core));
            self.halts.lock().push(*info);
            HaltOutcome::Continue
        }

        fn pause_requested(&self, _ctx: &VmExitContext<'_>) -> bool {
            self.pause.swap(false, Ordering::AcqRel)
        }
    }

    #[test]
    fn test_halt_without_debugger_is_ignored() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        halt(&mut ctx, PausingReason::EventTriggered, 1, 2);
        assert_eq!(state.session.owner(), None);
    }

    #[test]
    fn test_halt_kicks_other_processors_and_releases() {
        let (platform, state) = setup(3);
        let handler = Arc::new(RecordingHandler::default());
        state.session.set_handler(Some(handler.clone()));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        halt(&mut ctx, PausingReason::SoftwareBreakpointHit, 0, 0x1000);

        assert_eq!(platform.nmis_sent(), [1, 2]);
        assert_eq!(
            *handler.halts.lock(),
            [HaltInfo { reason: PausingReason::SoftwareBreakpointHit, core: 0, tag: 0, context: 0x1000 }]
        );
        assert_eq!(state.session.owner(), None);
        assert!(!state.session.is_halt_requested());
        assert!(state.session.halted_cores().is_empty());
    }

    #[test]
    fn test_pause_request_is_polled() {
        let (platform, state) = setup(1);
        let handler = Arc::new(RecordingHandler::default());
        state.session.set_handler(Some(handler.clone()));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        park_if_requested(&mut ctx);
        assert!(handler.halts.lock().is_empty());

        handler.pause.store(true, Ordering::Release);
        park_if_requested(&mut ctx);
        assert_eq!(handler.halts.lock()[0].reason, PausingReason::RequestFromDebugger);
    }

    #[test]
    fn test_process_switch_halts_once() {
        let (platform, state) = setup(1);
        let handler = Arc::new(RecordingHandler::default());
        state.session.set_handler(Some(handler.clone()));

        request_switch(&platform, &state, SwitchTarget::Process(1234)).unwrap();
        assert_eq!(state.resources.count(0, Interception::CrWrite(3)), 1);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        check_switch(&mut ctx);
        assert!(handler.halts.lock().is_empty());

        platform.set_process(ProcessInfo { pid: 1234, tid: 1, ..Default::default() });
        check_switch(&mut ctx);
        check_switch(&mut ctx);

        assert_eq!(handler.halts.lock().len(), 1);
        assert_eq!(handler.halts.lock()[0].reason, PausingReason::ProcessSwitched);
        assert_eq!(state.resources.count(0, Interception::CrWrite(3)), 0);
    }
}
