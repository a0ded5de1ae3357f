//! Stepping the halted thread: `t`, `i`, `p` and `gu`.
//!
//! A regular step-in sets RFLAGS.TF and waits for the single-step #DB of the same thread. A
//! step-over of a `call` places an execution breakpoint in DR0 at the return address; every
//! processor arms it at the end of its next exit, and only the stepping thread reaching it halts
//! the system. An instrumentation step uses the monitor trap flag with external interrupts held
//! back, so exactly one guest instruction runs no matter what the thread does.

use {
    crate::{
        debugger::{
            debug_registers::{HardwareBreakpoint, DR6_BS},
            disassembler,
            session::{self, PausingReason},
        },
        error::HypervisorError,
        intel::{
            vcpu::Interception,
            vmexit::{mtf, VmExitContext},
        },
        memory::mapper,
    },
    spin::Mutex,
    x86::vmx::vmcs::{guest, ro},
};

/// RFLAGS.TF.
pub const RFLAGS_TF: u64 = 1 << 8;

/// RFLAGS.RF: suppresses instruction breakpoints for one instruction.
pub const RFLAGS_RF: u64 = 1 << 16;

/// Upper bound of step-over iterations a `gu` performs before giving up.
pub const MAX_STEP_OUT_ITERATIONS: u32 = 0x10000;

/// Debug register used for step-over breakpoints.
const STEP_OVER_SLOT: usize = 0;

/// Step requests, in wire order.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepKind {
    StepIn = 0,
    InstrumentationStepIn,
    InstrumentationStepInForTracking,
    StepOver,
    StepOverForGu,
    /// The instruction at RIP is the `ret` that ends a `gu`; halt once more after it.
    StepOverForGuLastInstruction,
}

impl StepKind {
    pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
        Ok(match value {
            0 => StepKind::StepIn,
            1 => StepKind::InstrumentationStepIn,
            2 => StepKind::InstrumentationStepInForTracking,
            3 => StepKind::StepOver,
            4 => StepKind::StepOverForGu,
            5 => StepKind::StepOverForGuLastInstruction,
            _ => return Err(HypervisorError::ProtocolMismatch),
        })
    }
}

/// An instrumentation step in flight on one processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingStep {
    /// CS selector when the step started.
    pub cs: u16,
    /// Reported when the step completes.
    pub reason: PausingReason,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Thread {
    pid: u32,
    tid: u32,
}

impl Thread {
    fn current(ctx: &VmExitContext<'_>) -> Self {
        let info = ctx.platform.process_info();
        Self { pid: info.pid, tid: info.tid }
    }
}

#[derive(Debug, Copy, Clone)]
struct TrapStep {
    thread: Thread,
    trap_flag_was_set: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct StepOverTarget {
    address: u64,
    thread: Thread,
}

/// Steps shared by every processor: the stepping thread may migrate.
#[derive(Default)]
pub struct SteppingState {
    trap: Mutex<Option<TrapStep>>,
    step_over: Mutex<Option<StepOverTarget>>,
}

impl SteppingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return address a step-over waits for.
    pub fn step_over_target(&self) -> Option<u64> {
        self.step_over.lock().map(|target| target.address)
    }

    pub fn is_trap_stepping(&self) -> bool {
        self.trap.lock().is_some()
    }
}

/// Starts a step of the halted thread. Runs on the processor serving the debugger, before it
/// continues the system.
///
/// # Arguments
///
/// * `ctx` - The exit of the halted processor.
/// * `kind` - The step requested by the debugger.
pub fn start(ctx: &mut VmExitContext<'_>, kind: StepKind) -> Result<(), HypervisorError> {
    let rip = ctx.registers.rip;
    let thread = Thread::current(ctx);
    log::debug!("{:?} at {:#x} for {}:{}", kind, rip, thread.pid, thread.tid);

    match kind {
        StepKind::StepIn => step_in(ctx, thread),
        StepKind::InstrumentationStepIn => {
            instrument(ctx, PausingReason::Stepped);
            Ok(())
        }
        StepKind::InstrumentationStepInForTracking => {
            instrument(ctx, PausingReason::TrackingStepped);
            Ok(())
        }
        StepKind::StepOver | StepKind::StepOverForGu => match decode_at_rip(ctx) {
            Some(instruction) if disassembler::is_call(&instruction) => {
                let address = rip.wrapping_add(instruction.len() as u64);
                *ctx.state.stepping.step_over.lock() = Some(StepOverTarget { address, thread });
                Ok(())
            }
            _ => step_in(ctx, thread),
        },
        StepKind::StepOverForGuLastInstruction => match decode_at_rip(ctx) {
            Some(instruction) if disassembler::is_return(&instruction) => {
                instrument(ctx, PausingReason::Stepped);
                Ok(())
            }
            _ => {
                log::info!("Return at {:#x} is not readable, stepping in instead", rip);
                step_in(ctx, thread)
            }
        },
    }
}

/// The step a `gu` performs next, or `None` once it ran out of iterations.
///
/// # Arguments
///
/// * `bytes` - Instruction bytes at RIP.
/// * `bitness` - Code size of the guest.
/// * `iteration` - Steps already performed by this `gu`.
pub fn next_step_out(bytes: &[u8], bitness: u32, iteration: u32) -> Option<StepKind> {
    if iteration >= MAX_STEP_OUT_ITERATIONS {
        return None;
    }

    match disassembler::decode(bytes, bitness, 0) {
        Some(instruction) if disassembler::is_return(&instruction) => Some(StepKind::StepOverForGuLastInstruction),
        _ => Some(StepKind::StepOverForGu),
    }
}

fn decode_at_rip(ctx: &VmExitContext<'_>) -> Option<iced_x86::Instruction> {
    let rip = ctx.registers.rip;
    let bytes = disassembler::guest_instruction_bytes(ctx.platform, ctx.guest_cr3(), rip);
    let instruction = disassembler::decode(&bytes, disassembler::guest_bitness(ctx.platform), rip)?;

    // The whole instruction, up to its last byte, must be safely readable.
    mapper::check_access(ctx.platform, ctx.guest_cr3(), rip, instruction.len()).then_some(instruction)
}

fn step_in(ctx: &mut VmExitContext<'_>, thread: Thread) -> Result<(), HypervisorError> {
    let step = TrapStep { thread, trap_flag_was_set: ctx.registers.rflags & RFLAGS_TF != 0 };

    let previous = ctx.state.stepping.trap.lock().replace(step);
    if previous.is_none() {
        if let Err(error) = ctx.state.resources.acquire_on(ctx.platform, None, Interception::Exception(Some(1))) {
            *ctx.state.stepping.trap.lock() = None;
            return Err(error);
        }
    }

    ctx.registers.rflags |= RFLAGS_TF;
    Ok(())
}

fn instrument(ctx: &mut VmExitContext<'_>, reason: PausingReason) {
    let cs = ctx.platform.vmread(guest::CS_SELECTOR) as u16;
    ctx.vcpu.last_cs = cs;
    ctx.vcpu.step = Some(PendingStep { cs, reason });
    ctx.vcpu.mtf.registered = true;
    ctx.vcpu.mtf.ignore_mtf_unset = true;

    let counts = ctx.state.resources.counts(ctx.core());
    ctx.vcpu.hold_interrupts(ctx.platform, &counts);
    ctx.vcpu.set_monitor_trap_flag(ctx.platform, true);
}

/// Handles a #DB that may belong to a step. Returns false when the exception is the guest's.
///
/// On a #DB exit the processor leaves DR6 alone and reports the cause in the exit qualification.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-1. Exit Qualification for Debug Exceptions
pub fn handle_debug_exception(ctx: &mut VmExitContext<'_>) -> bool {
    let qualification = ctx.platform.vmread(ro::EXIT_QUALIFICATION);
    let rip = ctx.registers.rip;

    if qualification & DR6_BS != 0 {
        let current = Thread::current(ctx);
        let finished = {
            let mut trap = ctx.state.stepping.trap.lock();
            match *trap {
                Some(step) if step.thread == current => trap.take(),
                _ => None,
            }
        };

        if let Some(step) = finished {
            if !step.trap_flag_was_set {
                ctx.registers.rflags &= !RFLAGS_TF;
            }
            ctx.state.resources.release_on(ctx.platform, None, Interception::Exception(Some(1)));
            session::halt(ctx, PausingReason::Stepped, 0, rip);
            return true;
        }
    }

    if ctx.vcpu.debug_registers.hit(qualification) != Some(STEP_OVER_SLOT) {
        return false;
    }

    let current = Thread::current(ctx);
    let reached = {
        let mut target = ctx.state.stepping.step_over.lock();
        match *target {
            Some(step) if step.address == rip && step.thread == current => {
                *target = None;
                true
            }
            _ => false,
        }
    };

    if reached {
        ctx.vcpu.debug_registers.clear(ctx.platform, &ctx.state.resources, ctx.core(), STEP_OVER_SLOT);
        session::halt(ctx, PausingReason::Stepped, 0, rip);
    } else {
        // Another thread passed the return address; let it run the instruction.
        ctx.registers.rflags |= RFLAGS_RF;
    }

    true
}

/// Completes an instrumentation step on its MTF exit. Returns false when no step was pending.
pub fn handle_mtf(ctx: &mut VmExitContext<'_>) -> bool {
    let Some(step) = ctx.vcpu.step.take() else {
        return false;
    };

    ctx.vcpu.mtf.registered = false;
    ctx.vcpu.mtf.ignore_mtf_unset = false;
    let counts = ctx.state.resources.counts(ctx.core());
    ctx.vcpu.release_interrupts(ctx.platform, &counts);

    mtf::report_mode_change(ctx, step.cs);

    let rip = ctx.registers.rip;
    session::halt(ctx, step.reason, 0, rip);
    true
}

/// Arms or disarms the step-over breakpoint of the calling processor to match the shared target.
/// Runs at the end of every exit.
pub fn sync_step_over(ctx: &mut VmExitContext<'_>) {
    let target = ctx.state.stepping.step_over_target();
    let armed = ctx.vcpu.debug_registers.slot(STEP_OVER_SLOT).map(|breakpoint| breakpoint.address);
    if target == armed {
        return;
    }

    let core = ctx.core();
    if armed.is_some() {
        ctx.vcpu.debug_registers.clear(ctx.platform, &ctx.state.resources, core, STEP_OVER_SLOT);
    }

    if let Some(address) = target {
        let breakpoint = HardwareBreakpoint::execute(address);
        if let Err(error) = ctx.vcpu.debug_registers.set(ctx.platform, &ctx.state.resources, core, STEP_OVER_SLOT, breakpoint) {
            log::error!("Processor {} could not arm step-over at {:#x}: {}", core, address, error);
        }
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
            CoreState,
        },
        alloc::sync::Arc,
    };

    const CALL: [u8; 7] = [0xE8, 0x05, 0x00, 0x00, 0x00, 0x90, 0x90];

    fn with_code(code: &[u8], at: u64) -> (MockPlatform, CoreState, Arc<RecordingHandler>) {
        let (platform, state) = setup(2);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, at, code);
        platform.set_vmcs(guest::CR3, cr3);
        platform.set_vmcs(guest::CS_ACCESS_RIGHTS, 1 << 13);

        let handler = Arc::new(RecordingHandler::default());
        state.session.set_handler(Some(handler.clone()));
        (platform, state, handler)
    }

    #[test]
    fn test_step_over_call_halts_at_return_address() {
        let (platform, state, handler) = with_code(&CALL, 0x1000);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x1000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        start(&mut ctx, StepKind::StepOver).unwrap();
        assert_eq!(state.stepping.step_over_target(), Some(0x1005));
        assert_eq!(ctx.registers.rflags & RFLAGS_TF, 0);

        sync_step_over(&mut ctx);
        assert_eq!(platform.debug_register(0), 0x1005);

        // The call returns; DR0 fires at 0x1005.
        ctx.registers.rip = 0x1005;
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 0b0001);
        assert!(handle_debug_exception(&mut ctx));

        assert_eq!(handler.halts.lock()[0].reason, PausingReason::Stepped);
        assert_eq!(handler.halts.lock()[0].context, 0x1005);
        assert_eq!(state.stepping.step_over_target(), None);
        assert!(ctx.vcpu.debug_registers.slot(0).is_none());
    }

    #[test]
    fn test_step_over_target_reached_by_other_thread_resumes() {
        let (platform, state, handler) = with_code(&CALL, 0x1000);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x1000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        start(&mut ctx, StepKind::StepOver).unwrap();
        sync_step_over(&mut ctx);

        platform.set_process(ProcessInfo { pid: 99, tid: 100, ..Default::default() });
        ctx.registers.rip = 0x1005;
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 0b0001);
        assert!(handle_debug_exception(&mut ctx));

        assert!(handler.halts.lock().is_empty());
        assert_ne!(ctx.registers.rflags & RFLAGS_RF, 0);
        assert_eq!(state.stepping.step_over_target(), Some(0x1005));
    }

    #[test]
    fn test_step_over_of_non_call_degrades_to_step_in() {
        let (platform, state, handler) = with_code(&[0x90, 0x90], 0x3000);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x3000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        start(&mut ctx, StepKind::StepOver).unwrap();
        assert_eq!(state.stepping.step_over_target(), None);
        assert_ne!(ctx.registers.rflags & RFLAGS_TF, 0);
        assert_eq!(state.resources.count(1, Interception::Exception(Some(1))), 1);

        ctx.registers.rip = 0x3001;
        platform.set_vmcs(ro::EXIT_QUALIFICATION, DR6_BS);
        assert!(handle_debug_exception(&mut ctx));

        assert_eq!(handler.halts.lock()[0].reason, PausingReason::Stepped);
        assert_eq!(ctx.registers.rflags & RFLAGS_TF, 0);
        assert_eq!(state.resources.count(1, Interception::Exception(Some(1))), 0);

        // A later single-step trap is the guest's own.
        assert!(!handle_debug_exception(&mut ctx));
    }

    #[test]
    fn test_instrumentation_step_halts_on_mtf() {
        let (platform, state, handler) = with_code(&[0x90], 0x4000);
        platform.set_vmcs(guest::CS_SELECTOR, 0x10);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x4000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        start(&mut ctx, StepKind::InstrumentationStepInForTracking).unwrap();
        assert!(ctx.vcpu.wants_monitor_trap_flag());
        assert!(ctx.vcpu.hold_interrupts);

        ctx.registers.rip = 0x4001;
        assert!(handle_mtf(&mut ctx));
        assert!(!ctx.vcpu.hold_interrupts);
        assert!(!ctx.vcpu.wants_monitor_trap_flag());
        assert_eq!(handler.halts.lock()[0].reason, PausingReason::TrackingStepped);
        assert!(!handle_mtf(&mut ctx));
    }

    #[test]
    fn test_step_out_of_unreadable_return_steps_in() {
        // `ret 8` whose immediate lies on the next, unmapped page.
        let (platform, state, _) = with_code(&[0xC2], 0x5FFF);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x5FFF, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        start(&mut ctx, StepKind::StepOverForGuLastInstruction).unwrap();
        assert!(ctx.vcpu.step.is_none());
        assert!(state.stepping.is_trap_stepping());
    }

    #[test]
    fn test_next_step_out() {
        assert_eq!(next_step_out(&[0xC3], 64, 0), Some(StepKind::StepOverForGuLastInstruction));
        assert_eq!(next_step_out(&CALL, 64, 3), Some(StepKind::StepOverForGu));
        assert_eq!(next_step_out(&CALL, 64, MAX_STEP_OUT_ITERATIONS), None);
    }
}
