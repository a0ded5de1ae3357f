//! Handles control-register access exits.
//!
//! Writes of CR0 and CR4 exit while their guest/host mask is set; writes and reads of CR3 and CR8
//! exit through the processor-based controls. Reads of CR0 and CR4 are served by the read
//! shadows and never reach this module.

use {
    crate::{
        debugger::{
            events::{trigger, EventType},
            session,
        },
        intel::{
            vmerror::{CrAccessQualification, CrAccessType},
            vmexit::VmExitContext,
        },
    },
    x86::{
        msr::{IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1},
        vmx::vmcs::{control, guest, ro},
    },
};

/// CR3 bit 63: the write does not invalidate PCID-tagged translations. Not part of the stored value.
const CR3_NO_FLUSH: u64 = 1 << 63;

/// CR0.TS, cleared by `CLTS`.
const CR0_TS: u64 = 1 << 3;

/// CR0.PE, which `LMSW` can set but never clear.
const CR0_PE: u64 = 1 << 0;

/// Handles a control-register access exit.
///
/// Writes trigger `ControlRegisterModified` with the register number as context and, for CR3,
/// `ControlRegister3Modified` with the new directory base. Reads trigger `ControlRegisterRead`.
/// A completed CR3 write also checks whether a pending `.process` switch has been reached.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
pub fn handle_cr_access(ctx: &mut VmExitContext<'_>) {
    let qualification = CrAccessQualification(ctx.platform.vmread(ro::EXIT_QUALIFICATION));
    let cr = qualification.control_register();

    match qualification.access_type() {
        CrAccessType::MovToCr => {
            let value = ctx.registers.gpr(qualification.gpr());
            log::trace!("MOV to CR{}: {:#x}", cr, value);

            if cr == 3 {
                let cr3 = value & !CR3_NO_FLUSH;
                trigger::dispatch(ctx, EventType::ControlRegister3Modified, cr3, &|_| true, |ctx| {
                    modify(ctx, 3, value);
                });
                session::check_switch(ctx);
            } else {
                modify(ctx, cr, value);
            }
        }
        CrAccessType::MovFromCr => {
            let gpr = qualification.gpr();
            trigger::dispatch(ctx, EventType::ControlRegisterRead, u64::from(cr), &|event| event.matches_param(u64::from(cr)), |ctx| {
                let value = match cr {
                    3 => ctx.platform.vmread(guest::CR3),
                    8 => ctx.platform.read_cr(8),
                    _ => {
                        log::warn!("Unexpected read of CR{}", cr);
                        return;
                    }
                };
                ctx.registers.set_gpr(gpr, value);
            });
        }
        CrAccessType::Clts => {
            let cr0 = ctx.platform.vmread(control::CR0_READ_SHADOW) & !CR0_TS;
            modify(ctx, 0, cr0);
        }
        CrAccessType::Lmsw => {
            let cr0 = ctx.platform.vmread(control::CR0_READ_SHADOW);
            let source = u64::from(qualification.lmsw_source()) & 0xF;
            modify(ctx, 0, (cr0 & !0xE) | (source & 0xE) | ((cr0 | source) & CR0_PE));
        }
    }
}

/// Runs `ControlRegisterModified` for `cr` and performs the write.
fn modify(ctx: &mut VmExitContext<'_>, cr: u8, value: u64) {
    trigger::dispatch(ctx, EventType::ControlRegisterModified, u64::from(cr), &|event| event.matches_param(u64::from(cr)), |ctx| {
        write_cr(ctx, cr, value)
    });
}

#[rustfmt::skip]
fn write_cr(ctx: &mut VmExitContext<'_>, cr: u8, value: u64) {
    match cr {
        0 => {
            ctx.platform.vmwrite(control::CR0_READ_SHADOW, value);
            ctx.platform.vmwrite(guest::CR0, apply_fixed(ctx, value, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1));
        }
        3 => ctx.platform.vmwrite(guest::CR3, value & !CR3_NO_FLUSH),
        4 => {
            ctx.platform.vmwrite(control::CR4_READ_SHADOW, value);
            ctx.platform.vmwrite(guest::CR4, apply_fixed(ctx, value, IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1));
        }
        8 => ctx.platform.write_cr(8, value & 0xF),
        _ => log::warn!("Unexpected write of CR{}: {:#x}", cr, value),
    }
}

/// Forces the bits VMX operation requires to be set or clear.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.7 VMX-Fixed Bits in CR0 and A.8 VMX-Fixed Bits in CR4
fn apply_fixed(ctx: &VmExitContext<'_>, value: u64, fixed0: u32, fixed1: u32) -> u64 {
    let must_be_set = ctx.platform.rdmsr(fixed0).unwrap_or(0);
    let may_be_set = ctx.platform.rdmsr(fixed1).unwrap_or(u64::MAX);
    (value | must_be_set) & may_be_set
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::{
                events::{register_event, tests::setup, EventDescriptor},
                session::SwitchTarget,
            },
            intel::{registers::GuestRegisters, vcpu::VcpuState},
            platform::Platform,
        },
        alloc::vec,
    };

    #[test]
    fn test_mov_to_cr4_updates_guest_and_shadow() {
        let (platform, state) = setup(1);
        platform.set_msr(IA32_VMX_CR4_FIXED0, 0x2000);
        // mov cr4, rbx
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 4 | (3 << 8));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rbx: 0x0005_0678, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_cr_access(&mut ctx);

        assert_eq!(platform.vmcs(control::CR4_READ_SHADOW), 0x0005_0678);
        assert_eq!(platform.vmcs(guest::CR4), 0x0005_2678);
    }

    #[test]
    fn test_cr3_write_fires_both_events_and_drops_no_flush_bit() {
        let (platform, state) = setup(1);
        let any_cr3 = register_event(&platform, &state, EventDescriptor::new(EventType::ControlRegister3Modified), vec![]).unwrap();
        let mut modified = EventDescriptor::new(EventType::ControlRegisterModified);
        modified.params[0] = 3;
        let cr3_write = register_event(&platform, &state, modified, vec![]).unwrap();

        platform.set_vmcs(ro::EXIT_QUALIFICATION, 3);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rax: CR3_NO_FLUSH | 0x1AD000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_cr_access(&mut ctx);

        assert_eq!(platform.vmcs(guest::CR3), 0x1AD000);
        assert_eq!(state.events.find(any_cr3).unwrap().hit_count(), 1);
        assert_eq!(state.events.find(cr3_write).unwrap().hit_count(), 1);
    }

    #[test]
    fn test_cr3_write_reaching_awaited_process_is_checked() {
        let (platform, state) = setup(1);
        session::request_switch(&platform, &state, SwitchTarget::Process(1234)).unwrap();
        assert_eq!(state.session.switch_target(), Some(SwitchTarget::Process(1234)));

        platform.set_vmcs(ro::EXIT_QUALIFICATION, 3);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rax: 0x2000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        // Still another process; the switch keeps waiting.
        handle_cr_access(&mut ctx);
        assert_eq!(state.session.switch_target(), Some(SwitchTarget::Process(1234)));
    }

    #[test]
    fn test_clts_and_mov_from_cr8() {
        let (platform, state) = setup(1);
        platform.set_vmcs(control::CR0_READ_SHADOW, 0x8005_003B);
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 2 << 4);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_cr_access(&mut ctx);
        assert_eq!(platform.vmcs(control::CR0_READ_SHADOW), 0x8005_0033);

        platform.write_cr(8, 0xD);
        // mov rdx, cr8
        platform.set_vmcs(ro::EXIT_QUALIFICATION, 8 | (1 << 4) | (2 << 8));
        handle_cr_access(&mut ctx);
        assert_eq!(ctx.registers.rdx, 0xD);
    }
}
