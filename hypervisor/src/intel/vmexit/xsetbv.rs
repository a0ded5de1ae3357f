//! Provides handlers for managing VM exits due to the XSETBV instruction, ensuring
//! controlled manipulation of the extended control registers by guest VMs.

use crate::{
    debugger::events::{trigger, EventType},
    intel::{events::EventInjection, vmexit::VmExitContext},
};

/// XCR0 bit 0 (x87 state) must always be set.
const XCR0_X87: u64 = 1 << 0;

/// Manages the XSETBV instruction during a VM exit.
///
/// `XSETBV` events see the XCR number as their context. Only XCR0 exists; any other register,
/// or an XCR0 value without x87 state, raises #GP like the processor would.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
pub fn handle_xsetbv(ctx: &mut VmExitContext<'_>) {
    // Extract the XCR (extended control register) number from the guest's RCX register.
    let xcr = ctx.registers.rcx as u32;

    trigger::dispatch(ctx, EventType::XsetbvInstructionExecution, u64::from(xcr), &|_| true, |ctx| {
        // Combine the guest's RAX and RDX registers to form the 64-bit value for the XCR.
        let value = ctx.registers.edx_eax();
        log::trace!("XSETBV executed with xcr: {:#x}, value: {:#x}", xcr, value);

        if xcr != 0 || value & XCR0_X87 == 0 {
            EventInjection::inject_gp(ctx.platform, 0);
            ctx.vcpu.suppress_rip_increment();
            return;
        }

        ctx.platform.xsetbv(xcr, value);
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
    fn test_xcr0_is_written_and_bad_xcr_faults() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rax: 0x7, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        handle_xsetbv(&mut ctx);
        assert_eq!(platform.xcr_writes(), [(0, 7)]);

        ctx.registers.rcx = 1;
        handle_xsetbv(&mut ctx);
        assert_eq!(platform.xcr_writes().len(), 1);
        assert!(!ctx.vcpu.increment_rip);
    }
}
