//! Handles MOV DR exits, which only happen while the debugger owns a debug register.

use {
    crate::{
        debugger::events::{trigger, EventType},
        intel::{events::EventInjection, vmerror::DrAccessQualification, vmexit::VmExitContext},
    },
    x86::vmx::vmcs::{guest, ro},
};

/// CR4.DE: DR4 and DR5 are reserved instead of aliasing DR6 and DR7.
const CR4_DE: u64 = 1 << 3;

/// Handles a MOV DR exit.
///
/// `DebugRegistersAccessed` events see the register number as their context. The access is then
/// served from the guest's view of the debug registers, so breakpoints the debugger placed stay
/// invisible.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 18.2.2 Debug Registers DR4 and DR5
pub fn handle_dr_access(ctx: &mut VmExitContext<'_>) {
    let qualification = DrAccessQualification(ctx.platform.vmread(ro::EXIT_QUALIFICATION));
    let register = qualification.debug_register();

    let index = match register {
        4 | 5 if ctx.platform.vmread(guest::CR4) & CR4_DE != 0 => {
            EventInjection::inject_ud(ctx.platform);
            ctx.vcpu.suppress_rip_increment();
            return;
        }
        4 | 5 => register + 2,
        _ => register,
    };

    trigger::dispatch(ctx, EventType::DebugRegistersAccessed, u64::from(register), &|_| true, |ctx| {
        let gpr = qualification.gpr();
        if qualification.direction_read() {
            let value = ctx.vcpu.debug_registers.guest_read(ctx.platform, index);
            ctx.registers.set_gpr(gpr, value);
        } else {
            let value = ctx.registers.gpr(gpr);
            ctx.vcpu.debug_registers.guest_write(ctx.platform, index, value);
        }
    });
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::{
                debug_registers::HardwareBreakpoint,
                events::{register_event, tests::setup, EventDescriptor},
            },
            intel::{registers::GuestRegisters, vcpu::VcpuState},
            platform::Platform,
        },
        alloc::vec,
    };

    #[test]
    fn test_guest_reads_its_own_dr0() {
        let (platform, state) = setup(1);
        let tag = register_event(&platform, &state, EventDescriptor::new(EventType::DebugRegistersAccessed), vec![]).unwrap();

        let mut vcpu = VcpuState::new(0).unwrap();
        vcpu.debug_registers.set(&platform, &state.resources, 0, 0, HardwareBreakpoint::execute(0x1234)).unwrap();

        let mut registers = GuestRegisters { rcx: 0x9999, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        // mov dr0, rcx
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 1 << 8);
        handle_dr_access(&mut ctx);
        assert_eq!(platform.debug_register(0), 0x1234);

        // mov rax, dr0
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 1 << 4);
        handle_dr_access(&mut ctx);
        assert_eq!(ctx.registers.rax, 0x9999);
        assert_eq!(state.events.find(tag).unwrap().hit_count(), 2);
    }

    #[test]
    fn test_dr4_aliases_dr6_unless_cr4_de() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        platform.write_dr(6, 0xFFFF_0FF1);
        // mov rdx, dr4
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 4 | (1 << 4) | (2 << 8));
        handle_dr_access(&mut ctx);
        assert_eq!(ctx.registers.rdx, 0xFFFF_0FF1);

        platform.set_vmcs(guest::CR4, CR4_DE);
        handle_dr_access(&mut ctx);
        assert!(!ctx.vcpu.increment_rip);
        assert_eq!(platform.vmcs(x86::vmx::vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0xFF, 6);
    }
}
