//! SYSCALL and SYSRET emulation for `!syscall` and `!sysret` events.
//!
//! While EFER.SCE is hidden from the processor both instructions raise #UD, which exits. The
//! handler recognises the instruction, runs the events and performs the instruction's effect on
//! the guest state.

use {
    crate::{
        debugger::events::{trigger, EventType, SyscallTrapKind},
        intel::{events::EventInjection, vmexit::VmExitContext},
        memory::mapper,
    },
    x86::{
        msr::{IA32_FMASK, IA32_LSTAR, IA32_STAR},
        vmx::vmcs::guest,
    },
};

const SYSCALL: [u8; 2] = [0x0F, 0x05];
const SYSRETQ: [u8; 3] = [0x48, 0x0F, 0x07];

const RFLAGS_FIXED: u64 = 1 << 1;
const RFLAGS_RF: u64 = 1 << 16;
const RFLAGS_VM: u64 = 1 << 17;
const RFLAGS_RESERVED: u64 = 0xFFC3_8028;

/// Kernel addresses have their top byte set.
const KERNEL_ADDRESS_MASK: u64 = 0xFF00_0000_0000_0000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Instruction {
    Syscall,
    Sysret,
}

impl Instruction {
    fn len(self) -> u64 {
        match self {
            Instruction::Syscall => SYSCALL.len() as u64,
            Instruction::Sysret => SYSRETQ.len() as u64,
        }
    }
}

/// Handles a #UD raised while syscall trapping is active. Returns false when the faulting
/// instruction is neither SYSCALL nor SYSRET and the #UD belongs to the guest.
pub fn handle_undefined_opcode(ctx: &mut VmExitContext<'_>) -> bool {
    let rip = ctx.registers.rip;

    let instruction = if trap_kind(ctx) == SyscallTrapKind::HandleAllUd {
        if rip & KERNEL_ADDRESS_MASK != 0 {
            Instruction::Sysret
        } else {
            Instruction::Syscall
        }
    } else {
        let mut bytes = [0u8; 3];
        if mapper::read_virtual(ctx.platform, ctx.guest_cr3(), rip, &mut bytes).is_err() {
            // The code page is paged out; fault it in and see the instruction again.
            EventInjection::inject_pf(ctx.platform, rip, 0);
            return true;
        }

        if bytes[..2] == SYSCALL {
            Instruction::Syscall
        } else if bytes == SYSRETQ {
            Instruction::Sysret
        } else {
            return false;
        }
    };

    let outcome = match instruction {
        Instruction::Syscall => {
            let number = ctx.registers.rax;
            trigger::dispatch(ctx, EventType::SyscallHookEferSyscall, number, &|event| event.matches_param(number), emulate_syscall)
        }
        Instruction::Sysret => trigger::dispatch(ctx, EventType::SyscallHookEferSysret, rip, &|_| true, emulate_sysret),
    };

    if outcome.short_circuit {
        ctx.registers.rip = rip.wrapping_add(instruction.len());
    }

    true
}

/// The most permissive recognition mode any registered event asked for.
fn trap_kind(ctx: &VmExitContext<'_>) -> SyscallTrapKind {
    let handle_all = [EventType::SyscallHookEferSyscall, EventType::SyscallHookEferSysret]
        .into_iter()
        .flat_map(|event_type| ctx.state.events.snapshot(event_type))
        .any(|event| event.params[1] == SyscallTrapKind::HandleAllUd as u64);

    if handle_all {
        SyscallTrapKind::HandleAllUd
    } else {
        SyscallTrapKind::SafeAccessMemory
    }
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: SYSCALL—Fast System Call
#[rustfmt::skip]
fn emulate_syscall(ctx: &mut VmExitContext<'_>) {
    let lstar = ctx.platform.rdmsr(IA32_LSTAR).unwrap_or(0);
    let fmask = ctx.platform.rdmsr(IA32_FMASK).unwrap_or(0);
    let star = ctx.platform.rdmsr(IA32_STAR).unwrap_or(0);

    ctx.registers.rcx = ctx.registers.rip.wrapping_add(Instruction::Syscall.len());
    ctx.registers.r11 = ctx.registers.rflags;
    ctx.registers.rip = lstar;
    ctx.registers.rflags &= !(fmask | RFLAGS_RF);

    let cs = ((star >> 32) as u16) & !3;
    ctx.platform.vmwrite(guest::CS_SELECTOR, u64::from(cs));
    ctx.platform.vmwrite(guest::CS_BASE, 0);
    ctx.platform.vmwrite(guest::CS_LIMIT, u64::from(u32::MAX));
    ctx.platform.vmwrite(guest::CS_ACCESS_RIGHTS, 0xA09B);

    ctx.platform.vmwrite(guest::SS_SELECTOR, u64::from(cs + 8));
    ctx.platform.vmwrite(guest::SS_BASE, 0);
    ctx.platform.vmwrite(guest::SS_LIMIT, u64::from(u32::MAX));
    ctx.platform.vmwrite(guest::SS_ACCESS_RIGHTS, 0xC093);
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: SYSRET—Return From Fast System Call
#[rustfmt::skip]
fn emulate_sysret(ctx: &mut VmExitContext<'_>) {
    let star = ctx.platform.rdmsr(IA32_STAR).unwrap_or(0);

    ctx.registers.rip = ctx.registers.rcx;
    ctx.registers.rflags = (ctx.registers.r11 & !(RFLAGS_RF | RFLAGS_VM | RFLAGS_RESERVED)) | RFLAGS_FIXED;

    let base = (star >> 48) as u16;
    ctx.platform.vmwrite(guest::CS_SELECTOR, u64::from(base.wrapping_add(16) | 3));
    ctx.platform.vmwrite(guest::CS_BASE, 0);
    ctx.platform.vmwrite(guest::CS_LIMIT, u64::from(u32::MAX));
    ctx.platform.vmwrite(guest::CS_ACCESS_RIGHTS, 0xA0FB);

    ctx.platform.vmwrite(guest::SS_SELECTOR, u64::from(base.wrapping_add(8) | 3));
    ctx.platform.vmwrite(guest::SS_BASE, 0);
    ctx.platform.vmwrite(guest::SS_LIMIT, u64::from(u32::MAX));
    ctx.platform.vmwrite(guest::SS_ACCESS_RIGHTS, 0xC0F3);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::events::{register_event, tests::setup, EventDescriptor},
            intel::{registers::GuestRegisters, vcpu::VcpuState},
        },
        alloc::vec,
    };

    const STAR: u64 = (0x23 << 48) | (0x10 << 32);

    #[test]
    fn test_syscall_enters_kernel_and_fires_event() {
        let (platform, state) = setup(1);
        let mut descriptor = EventDescriptor::new(EventType::SyscallHookEferSyscall);
        descriptor.params[0] = 0x55;
        let tag = register_event(&platform, &state, descriptor, vec![]).unwrap();

        platform.set_msr(IA32_LSTAR, 0xFFFF_F800_0010_0000);
        platform.set_msr(IA32_FMASK, 0x4700);
        platform.set_msr(IA32_STAR, STAR);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x7FF0_0000, &[0x0F, 0x05, 0xC3]);
        platform.set_vmcs(guest::CR3, cr3);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x7FF0_0000, rax: 0x55, rflags: 0x246, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_undefined_opcode(&mut ctx));
        assert_eq!(ctx.registers.rip, 0xFFFF_F800_0010_0000);
        assert_eq!(ctx.registers.rcx, 0x7FF0_0002);
        assert_eq!(ctx.registers.r11, 0x246);
        assert_eq!(ctx.registers.rflags, 0x046);
        assert_eq!(platform.vmcs(guest::CS_SELECTOR), 0x10);
        assert_eq!(platform.vmcs(guest::SS_SELECTOR), 0x18);
        assert_eq!(state.events.find(tag).unwrap().hit_count(), 1);
    }

    #[test]
    fn test_sysret_returns_to_user() {
        let (platform, state) = setup(1);
        platform.set_msr(IA32_STAR, STAR);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0xFFFF_F800_0020_0000, &SYSRETQ);
        platform.set_vmcs(guest::CR3, cr3);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0xFFFF_F800_0020_0000, rcx: 0x7FF0_0002, r11: 0x1_0246, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_undefined_opcode(&mut ctx));
        assert_eq!(ctx.registers.rip, 0x7FF0_0002);
        assert_eq!(ctx.registers.rflags, 0x246);
        assert_eq!(platform.vmcs(guest::CS_SELECTOR), 0x33);
        assert_eq!(platform.vmcs(guest::SS_SELECTOR), 0x2B);
    }

    #[test]
    fn test_other_ud_is_not_ours() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x1000, &[0x0F, 0x0B, 0x90]);
        platform.set_vmcs(guest::CR3, cr3);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: 0x1000, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        assert!(!handle_undefined_opcode(&mut ctx));
    }
}
