//! Handles port I/O exits: `IN`, `OUT` and their string forms `INS`/`OUTS`, with or without `REP`.

use {
    crate::{
        debugger::events::{trigger, EventType},
        intel::{events::EventInjection, vmerror::IoQualification, vmexit::VmExitContext},
        memory::mapper,
        platform::AccessSize,
    },
    x86::vmx::vmcs::ro,
};

/// RFLAGS.DF: string instructions walk downwards.
const RFLAGS_DF: u64 = 1 << 10;

/// Handles an I/O instruction exit.
///
/// `IN`/`OUT` events see the port as their context and filter on it through their first
/// parameter. The emulation performs the access on the host port; string forms move the data
/// between the port and guest memory at RSI/RDI and honor `REP` and the direction flag.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
pub fn handle_io(ctx: &mut VmExitContext<'_>) {
    let qualification = IoQualification(ctx.platform.vmread(ro::EXIT_QUALIFICATION));
    let port = qualification.port();
    let Some(size) = qualification.size() else {
        log::warn!("Invalid I/O access size in qualification {:#x}", qualification.0);
        return;
    };

    log::trace!("I/O {} port {:#x} size {:?}", if qualification.direction_in() { "in" } else { "out" }, port, size);

    let event_type = if qualification.direction_in() {
        EventType::InInstructionExecution
    } else {
        EventType::OutInstructionExecution
    };

    trigger::dispatch(ctx, event_type, u64::from(port), &|event| event.matches_param(u64::from(port)), |ctx| {
        if qualification.string() {
            emulate_string(ctx, qualification, size);
        } else if qualification.direction_in() {
            let value = u64::from(ctx.platform.port_read(port, size));
            ctx.registers.rax = (ctx.registers.rax & !size.mask()) | (value & size.mask());
        } else {
            ctx.platform.port_write(port, size, (ctx.registers.rax & size.mask()) as u32);
        }
    });
}

/// Emulates `INS`/`OUTS`. A fault on guest memory stops the transfer and raises #PF with the
/// registers describing the elements already moved, as the processor would.
fn emulate_string(ctx: &mut VmExitContext<'_>, qualification: IoQualification, size: AccessSize) {
    let width = size as u64;
    let step = if ctx.registers.rflags & RFLAGS_DF != 0 { width.wrapping_neg() } else { width };
    let count = if qualification.rep() { ctx.registers.rcx } else { 1 };
    let cr3 = ctx.guest_cr3();
    let port = qualification.port();

    for _ in 0..count {
        let mut element = [0u8; 4];
        let bytes = &mut element[..width as usize];

        if qualification.direction_in() {
            let value = ctx.platform.port_read(port, size);
            bytes.copy_from_slice(&value.to_le_bytes()[..width as usize]);
            if mapper::write_virtual(ctx.platform, cr3, ctx.registers.rdi, bytes).is_err() {
                page_fault(ctx, ctx.registers.rdi, true);
                return;
            }
            ctx.registers.rdi = ctx.registers.rdi.wrapping_add(step);
        } else {
            if mapper::read_virtual(ctx.platform, cr3, ctx.registers.rsi, bytes).is_err() {
                page_fault(ctx, ctx.registers.rsi, false);
                return;
            }
            ctx.platform.port_write(port, size, u32::from_le_bytes(element));
            ctx.registers.rsi = ctx.registers.rsi.wrapping_add(step);
        }

        if qualification.rep() {
            ctx.registers.rcx -= 1;
        }
    }
}

fn page_fault(ctx: &mut VmExitContext<'_>, address: u64, write: bool) {
    const PF_WRITE: u32 = 1 << 1;

    EventInjection::inject_pf(ctx.platform, address, if write { PF_WRITE } else { 0 });
    ctx.vcpu.suppress_rip_increment();
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::events::tests::setup,
            intel::{registers::GuestRegisters, vcpu::VcpuState},
        },
        x86::vmx::vmcs::guest,
    };

    #[test]
    fn test_in_merges_into_al() {
        let (platform, state) = setup(1);
        platform.set_port(0x64, 0x1C);
        // in al, 0x64
        platform.set_vmcs(ro::EXIT_QUALIFICATION, (0x64 << 16) | (1 << 3) | (1 << 6));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rax: 0xAAAA_BBBB, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_io(&mut ctx);

        assert_eq!(ctx.registers.rax, 0xAAAA_BB1C);
    }

    #[test]
    fn test_rep_outsb_writes_each_byte() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x7000, b"abc");
        platform.set_vmcs(guest::CR3, cr3);
        // rep outsb to port 0x3F8
        platform.set_vmcs(ro::EXIT_QUALIFICATION, (0x3F8 << 16) | (1 << 4) | (1 << 5));

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rsi: 0x7000, rcx: 3, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_io(&mut ctx);

        let written: Vec<u32> = platform.port_writes().into_iter().map(|(_, _, value)| value).collect();
        assert_eq!(written, [u32::from(b'a'), u32::from(b'b'), u32::from(b'c')]);
        assert_eq!((ctx.registers.rsi, ctx.registers.rcx), (0x7003, 0));
    }
}
