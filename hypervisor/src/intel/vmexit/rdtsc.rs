//! Handles RDTSC virtualization tasks, specifically intercepting and managing
//! the `RDTSC`, `RDTSCP` and `RDPMC` instructions in a VM so that time information
//! provided to the guest does not reveal the hypervisor.

use crate::{
    debugger::events::{trigger, EventType},
    intel::{events::EventInjection, vmexit::VmExitContext},
};

/// Handles the `RDTSC` and `RDTSCP` VM-exits.
///
/// This function is invoked when the guest executes the `RDTSC` or `RDTSCP` instruction.
/// It reads the host's time-stamp counter, lets the transparency layer reshape it and updates
/// the guest's RAX and RDX registers with the low and high 32-bits of the counter, respectively.
/// `RDTSCP` also loads `IA32_TSC_AUX` into RCX.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `with_aux` - Whether the instruction was `RDTSCP`.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 16 and 51.
pub fn handle_rdtsc(ctx: &mut VmExitContext<'_>, with_aux: bool) {
    trigger::dispatch(ctx, EventType::TscInstructionExecution, 0, &|_| true, |ctx| {
        let (real, aux) = if with_aux { ctx.platform.rdtscp() } else { (ctx.platform.rdtsc(), 0) };
        let tsc = ctx.state.transparency.tsc(ctx.core(), real);

        ctx.registers.rax = tsc & 0xFFFF_FFFF;
        ctx.registers.rdx = tsc >> 32;
        if with_aux {
            ctx.registers.rcx = u64::from(aux);
        }
    });
}

/// Handles the `RDPMC` VM-exit. An invalid counter index raises #GP in the guest.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 15.
pub fn handle_rdpmc(ctx: &mut VmExitContext<'_>) {
    trigger::dispatch(ctx, EventType::PmcInstructionExecution, 0, &|_| true, |ctx| {
        match ctx.platform.rdpmc(ctx.registers.rcx as u32) {
            Some(value) => {
                ctx.registers.rax = value & 0xFFFF_FFFF;
                ctx.registers.rdx = value >> 32;
            }
            None => {
                EventInjection::inject_gp(ctx.platform, 0);
                ctx.vcpu.suppress_rip_increment();
            }
        }
    });
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

    #[test]
    fn test_rdtscp_loads_aux_and_splits_counter() {
        let (platform, state) = setup(1);
        platform.set_tsc(0x1_2345_6700);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_rdtsc(&mut ctx, true);

        assert_eq!(ctx.registers.rdx, 1);
        assert_eq!(ctx.registers.rax, 0x2345_6700 + 100);
        assert_eq!(ctx.registers.rcx, 0);
    }

    #[test]
    fn test_rdpmc_of_missing_counter_faults() {
        let (platform, state) = setup(1);
        platform.set_pmc(0, 0x55);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_rdpmc(&mut ctx);
        assert_eq!(ctx.registers.rax, 0x55);

        ctx.registers.rcx = 9;
        handle_rdpmc(&mut ctx);
        assert!(!ctx.vcpu.increment_rip);
    }
}
