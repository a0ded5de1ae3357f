//! Handles monitor trap flag exits.
//!
//! MTF is shared by several users on the same processor: hidden hooks stepping over an access to
//! the original page, breakpoints stepping over their original byte, guaranteed steps and
//! instruction tracing. Each exit serves all of them in that order, then leaves MTF set only if
//! one of them still needs it.

use {
    crate::{
        debugger::{
            breakpoints,
            events::{trigger, EventStage, EventType, ModeTrapKind},
            hooks, stepping,
        },
        intel::vmexit::VmExitContext,
    },
    x86::vmx::vmcs::guest,
};

/// Handles a monitor trap flag exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.5.2 Monitor Trap Flag
pub fn handle_monitor_trap_flag(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();

    if ctx.vcpu.mtf.ignore_one_mtf {
        ctx.vcpu.mtf.ignore_one_mtf = false;
        log::trace!("Skipping MTF exit at {:#x}", ctx.registers.rip);
        return;
    }

    hooks::restore_resting(ctx);
    hooks::trigger_deferred_post_events(ctx);
    breakpoints::rearm(ctx);

    let stepped = stepping::handle_mtf(ctx);

    if ctx.vcpu.tracing && !stepped {
        let rip = ctx.registers.rip;
        trigger::trigger_events(ctx, EventType::TrapExecutionInstructionTrace, EventStage::Pre, rip, &|_| true);
        let previous_cs = ctx.vcpu.last_cs;
        report_mode_change(ctx, previous_cs);
    }

    let keep = ctx.vcpu.wants_monitor_trap_flag();
    ctx.vcpu.mtf.registered &= keep;
    ctx.vcpu.set_monitor_trap_flag(ctx.platform, keep);
}

/// Triggers `TrapExecutionModeChanged` when the privilege level differs from the one `previous_cs`
/// ran at. The new level is the event context.
pub fn report_mode_change(ctx: &mut VmExitContext<'_>, previous_cs: u16) {
    let cs = ctx.platform.vmread(guest::CS_SELECTOR) as u16;
    ctx.vcpu.last_cs = cs;

    let cpl = (cs & 3) as u8;
    if cpl == (previous_cs & 3) as u8 {
        return;
    }

    log::trace!("Processor {} moved to ring {} at {:#x}", ctx.core(), cpl, ctx.registers.rip);
    trigger::trigger_events(ctx, EventType::TrapExecutionModeChanged, EventStage::Pre, u64::from(cpl), &|event| {
        ModeTrapKind::from_u64(event.params[0]).is_some_and(|kind| kind.reports(cpl))
    });
}
