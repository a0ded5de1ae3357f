//! Handles external interrupt, interrupt-window and NMI-window exits.
//!
//! External interrupts only exit while an `!interrupt` event, a pending `.thread` switch or a
//! guaranteed step needs them. The interrupt is acknowledged on exit, so the handler owns it and
//! must deliver it to the guest itself, immediately or once the guest can take it.

use {
    crate::{
        debugger::{
            events::{trigger, EventType},
            session,
        },
        intel::{
            events::{EventInjection, InterruptionType},
            vmerror::VmExitInterruptionInformation,
            vmexit::VmExitContext,
        },
    },
    x86::vmx::vmcs::{
        control::{self, PrimaryControls},
        ro,
    },
};

/// Handles an external interrupt exit.
///
/// `ExternalInterruptOccurred` events see the vector as their context. While a guaranteed step
/// holds interrupts back, the vector is queued and delivered through the interrupt window after
/// the step.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.2 Information for VM Exits Due to Vectored Events
pub fn handle_external_interrupt(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();

    let info = VmExitInterruptionInformation(ctx.platform.vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);
    if !info.valid() {
        log::warn!("External interrupt exit without a vector");
        return;
    }
    let vector = info.vector();

    if ctx.vcpu.hold_interrupts && ctx.vcpu.queue_held_interrupt(vector) {
        log::trace!("Holding interrupt {:#x} on processor {}", vector, ctx.core());
        return;
    }

    trigger::dispatch(ctx, EventType::ExternalInterruptOccurred, u64::from(vector), &|event| event.matches_param(u64::from(vector)), |ctx| {
        deliver(ctx, vector)
    });

    session::check_switch(ctx);
}

/// Injects `vector` now, or queues it when another event already occupies the entry.
fn deliver(ctx: &mut VmExitContext<'_>, vector: u8) {
    if EventInjection::is_pending(ctx.platform) {
        if ctx.vcpu.queue_held_interrupt(vector) {
            ctx.vcpu.set_interrupt_window_exiting(ctx.platform, true);
        } else {
            log::error!("Interrupt {:#x} dropped, queue full", vector);
        }
        return;
    }

    EventInjection::inject(ctx.platform, vector, InterruptionType::ExternalInterrupt, None, 0);
}

/// Delivers one held interrupt. The window stays open while more are queued.
pub fn handle_interrupt_window(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();

    if ctx.vcpu.held_interrupts.is_empty() || EventInjection::is_pending(ctx.platform) {
        ctx.vcpu.set_interrupt_window_exiting(ctx.platform, !ctx.vcpu.held_interrupts.is_empty());
        return;
    }

    let vector = ctx.vcpu.held_interrupts.remove(0);
    EventInjection::inject(ctx.platform, vector, InterruptionType::ExternalInterrupt, None, 0);
    ctx.vcpu.set_interrupt_window_exiting(ctx.platform, !ctx.vcpu.held_interrupts.is_empty());
}

/// Delivers an NMI that arrived while the processor was in VMX root. The host IDT opens the NMI
/// window for it. An NMI sent to force an exit has done its job by now and is not delivered.
pub fn handle_nmi_window(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();

    let primary = ctx.platform.vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & !u64::from(PrimaryControls::NMI_WINDOW_EXITING.bits());
    ctx.platform.vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary);

    if ctx.state.resources.take_nmi_request(ctx.core()) {
        log::trace!("NMI window on processor {} closed a forced exit", ctx.core());
        return;
    }

    EventInjection::inject(ctx.platform, 2, InterruptionType::NonMaskableInterrupt, None, 0);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::events::tests::setup,
            intel::{registers::GuestRegisters, vcpu::VcpuState},
        },
    };

    fn external(vector: u8) -> u64 {
        u64::from(vector) | (1 << 31)
    }

    #[test]
    fn test_interrupt_is_reinjected() {
        let (platform, state) = setup(1);
        platform.set_vmcs(ro::VMEXIT_INTERRUPTION_INFO, external(0xD1));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_external_interrupt(&mut ctx);

        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD), external(0xD1));
    }

    #[test]
    fn test_held_interrupts_wait_for_window() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let counts = state.resources.counts(0);
        vcpu.hold_interrupts(&platform, &counts);

        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        for vector in [0x30, 0x31] {
            platform.set_vmcs(ro::VMEXIT_INTERRUPTION_INFO, external(vector));
            handle_external_interrupt(&mut ctx);
        }
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0);

        ctx.vcpu.release_interrupts(&platform, &counts);
        let window = u64::from(PrimaryControls::INTERRUPT_WINDOW_EXITING.bits());
        assert_ne!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & window, 0);

        handle_interrupt_window(&mut ctx);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD), external(0x30));
        assert_ne!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & window, 0);

        platform.set_vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD, 0);
        handle_interrupt_window(&mut ctx);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD), external(0x31));
        assert_eq!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & window, 0);
    }

    #[test]
    fn test_nmi_window_delivers_only_guest_nmis() {
        let (platform, state) = setup(1);
        let window = u64::from(PrimaryControls::NMI_WINDOW_EXITING.bits());
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        state.resources.request_exit(&platform, 0);
        platform.set_vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS, window);
        handle_nmi_window(&mut ctx);
        assert_eq!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & window, 0);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0);

        platform.set_vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS, window);
        handle_nmi_window(&mut ctx);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0x7FF, 2 | (2 << 8));
    }
}
