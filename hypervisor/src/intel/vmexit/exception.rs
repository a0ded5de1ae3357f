//! Handles exceptions and NMIs intercepted through the exception bitmap.
//!
//! Every vector either belongs to the debugger (hidden breakpoints, `bp`, steps, the syscall
//! trap, the NMI that halts a processor) or is delivered back to the guest as if nothing had
//! intercepted it.

use {
    crate::{
        debugger::{
            breakpoints,
            events::{trigger, EventType},
            hooks, stepping,
        },
        intel::{
            events::{EventInjection, InterruptionType},
            vmerror::{ExceptionInterrupt, VmExitInterruptionInformation},
            vmexit::{syscall, VmExitContext},
        },
        platform::Platform,
    },
    x86::vmx::vmcs::ro,
};

/// B0-B3, BD and BS of DR6, as reported in the #DB exit qualification.
const DR6_CAUSE_BITS: u64 = 0x600F;

/// DR6 bits that always read as one.
const DR6_FIXED: u64 = 0xFFFF_0FF0;

/// Handles an exception or NMI exit.
///
/// The RIP never advances: faults re-execute after delivery and traps already report the next
/// instruction.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.2 Other Causes of VM Exits: Exceptions
pub fn handle_exception(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();

    let info = VmExitInterruptionInformation(ctx.platform.vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);
    if !info.valid() {
        log::warn!("Exception exit without valid interruption information");
        return;
    }

    let vector = info.vector();
    log::trace!("Exception {} on processor {} at {:#x}", vector, ctx.core(), ctx.registers.rip);

    match ExceptionInterrupt::from_vector(vector) {
        Some(ExceptionInterrupt::NonMaskableInterrupt) if info.interruption_type() == InterruptionType::NonMaskableInterrupt as u8 => {
            if ctx.state.resources.take_nmi_request(ctx.core()) {
                log::trace!("NMI on processor {} was a halt request", ctx.core());
            } else {
                EventInjection::reinject(ctx.platform, info);
            }
        }
        Some(ExceptionInterrupt::Breakpoint) => {
            if hooks::handle_breakpoint(ctx) || breakpoints::handle_breakpoint(ctx) {
                return;
            }
            deliver(ctx, info);
        }
        Some(ExceptionInterrupt::Debug) => {
            if stepping::handle_debug_exception(ctx) {
                return;
            }
            let qualification = ctx.platform.vmread(ro::EXIT_QUALIFICATION);
            ctx.platform.write_dr(6, DR6_FIXED | (qualification & DR6_CAUSE_BITS));
            deliver(ctx, info);
        }
        Some(ExceptionInterrupt::InvalidOpcode) if ctx.vcpu.syscall_trap_active() => {
            if syscall::handle_undefined_opcode(ctx) {
                return;
            }
            deliver(ctx, info);
        }
        Some(ExceptionInterrupt::PageFault) => {
            // CR2 is loaded on delivery, not on the exit.
            let address = ctx.platform.vmread(ro::EXIT_QUALIFICATION);
            ctx.platform.write_cr(2, address);
            deliver(ctx, info);
        }
        _ => deliver(ctx, info),
    }
}

/// Runs `ExceptionOccurred` events for the vector, then gives the exception back to the guest
/// unless an event short-circuited it.
fn deliver(ctx: &mut VmExitContext<'_>, info: VmExitInterruptionInformation) {
    let vector = u64::from(info.vector());
    trigger::dispatch(ctx, EventType::ExceptionOccurred, vector, &|event| event.matches_param(vector), |ctx| {
        EventInjection::reinject(ctx.platform, info)
    });
}
