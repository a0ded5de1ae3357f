use {
    crate::{
        debugger::{
            hooks,
            session::{self, PausingReason},
        },
        intel::{ept::AccessType, vmerror::EptViolationQualification, vmexit::VmExitContext},
    },
    x86::vmx::vmcs::ro,
};

/// Handle VM exits for EPT violations. Violations occur when an access to a guest physical address
/// is not permitted by the EPT entry that maps it.
///
/// Only hooked pages ever have rights removed, so every violation is handed to the hook engine.
/// A violation outside any hooked page means the tables and the hook records disagree; the guest
/// simply retries the access.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: 29.3.3.2 EPT Violations
pub fn handle_ept_violation(ctx: &mut VmExitContext<'_>) {
    let guest_pa = ctx.platform.vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = EptViolationQualification(ctx.platform.vmread(ro::EXIT_QUALIFICATION));
    log::trace!("EPT violation at gpa {:#x}: {:?}", guest_pa, qualification);

    let mut attempted = AccessType::empty();
    if qualification.data_read() {
        attempted |= AccessType::READ;
    }
    if qualification.data_write() {
        attempted |= AccessType::WRITE;
    }
    if qualification.instruction_fetch() {
        attempted |= AccessType::EXECUTE;
    }

    if !hooks::handle_ept_violation(ctx, guest_pa, attempted) {
        log::warn!("EPT violation at gpa {:#x} on a page that is not hooked", guest_pa);
        ctx.vcpu.suppress_rip_increment();
    }
}

/// Handles an EPT misconfiguration, which only a corrupted paging structure can cause. The
/// debugger gets to look at the system before anything else happens.
///
/// Reference: 29.3.3.1 EPT Misconfigurations
pub fn handle_ept_misconfiguration(ctx: &mut VmExitContext<'_>) {
    let guest_pa = ctx.platform.vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    log::error!("EPT misconfiguration at gpa {:#x}, rip {:#x}", guest_pa, ctx.registers.rip);

    ctx.vcpu.suppress_rip_increment();
    session::halt(ctx, PausingReason::GeneralDebugBreak, 0, guest_pa);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::events::{register_event, tests::setup, EventDescriptor, EventType},
            intel::{registers::GuestRegisters, vcpu::VcpuState},
        },
        alloc::vec,
        x86::vmx::vmcs::guest,
    };

    #[test]
    fn test_write_to_monitored_page_triggers_event() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x9000, &[0u8; 16])[0];
        platform.set_vmcs(guest::CR3, cr3);

        let mut descriptor = EventDescriptor::new(EventType::HiddenHookWrite);
        descriptor.params = [0x9000, 0x9010, 0, 0, 0, 0];
        let tag = register_event(&platform, &state, descriptor, vec![]).unwrap();

        platform.set_vmcs(ro::GUEST_PHYSICAL_ADDR_FULL, pa + 8);
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 0b10);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_ept_violation(&mut ctx);

        assert_eq!(state.events.find(tag).unwrap().hit_count(), 1);
        assert!(!ctx.vcpu.increment_rip);
        assert_eq!(ctx.vcpu.pending_ept_restore, [pa & !0xFFF]);
    }

    #[test]
    fn test_violation_outside_hooks_retries() {
        let (platform, state) = setup(1);
        platform.set_vmcs(ro::GUEST_PHYSICAL_ADDR_FULL, 0x5000);
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 0b1);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_ept_violation(&mut ctx);
        assert!(!ctx.vcpu.increment_rip);
    }
}
