//! Provides virtual machine management capabilities, specifically for handling MSR
//! read and write operations. It ensures that guest MSR accesses are properly
//! intercepted and handled, with support for injecting faults for accesses a bare
//! processor would reject.

use {
    crate::{
        debugger::events::{trigger, Event, EventType},
        intel::{events::EventInjection, vcpu::EFER_SCE, vmexit::VmExitContext},
    },
    x86::{msr::IA32_EFER, vmx::vmcs::guest},
};

/// Enum representing the type of MSR access.
///
/// There are two types of MSR access: reading from an MSR and writing to an MSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

/// Handles MSR access based on the provided access type.
///
/// `RDMSR`/`WRMSR` events see the MSR index as their context. The emulation performs the access
/// on the host; an access the host rejects is reflected to the guest as #GP. While syscall
/// trapping hides EFER.SCE, EFER accesses go through the guest's shadow of that bit.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `access_type` - The type of MSR access (read or write).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: RDMSR—Read From Model Specific Register or WRMSR—Write to Model Specific Register
/// and Table C-1. Basic Exit Reasons 31 and 32.
pub fn handle_msr_access(ctx: &mut VmExitContext<'_>, access_type: MsrAccessType) {
    const MSR_MASK_LOW: u64 = u32::MAX as u64;

    let msr_id = ctx.registers.rcx as u32;
    log::trace!("MSR {:?}: {:#x}", access_type, msr_id);

    if ctx.state.transparency.rejects_msr(ctx.state.config.transparency_inject_msr_gp, msr_id) {
        EventInjection::inject_gp(ctx.platform, 0);
        ctx.vcpu.suppress_rip_increment();
        return;
    }

    let event_type = match access_type {
        MsrAccessType::Read => EventType::RdmsrInstructionExecution,
        MsrAccessType::Write => EventType::WrmsrInstructionExecution,
    };
    let matches = |event: &Event| event.matches_param(u64::from(msr_id));

    trigger::dispatch(ctx, event_type, u64::from(msr_id), &matches, |ctx| match access_type {
        MsrAccessType::Read => {
            let value = if msr_id == IA32_EFER && ctx.vcpu.syscall_trap_active() {
                Some(shadowed_efer(ctx))
            } else {
                ctx.platform.rdmsr(msr_id)
            };

            match value {
                Some(value) => {
                    ctx.registers.rdx = value >> 32;
                    ctx.registers.rax = value & MSR_MASK_LOW;
                }
                None => fault(ctx),
            }
        }
        MsrAccessType::Write => {
            let value = ((ctx.registers.rdx & MSR_MASK_LOW) << 32) | (ctx.registers.rax & MSR_MASK_LOW);
            if msr_id == IA32_EFER && ctx.vcpu.syscall_trap_active() {
                ctx.vcpu.shadow_efer_sce = value & EFER_SCE != 0;
                ctx.platform.vmwrite(guest::IA32_EFER_FULL, value & !EFER_SCE);
            } else if !ctx.platform.wrmsr(msr_id, value) {
                fault(ctx);
            }
        }
    });
}

/// EFER as the guest believes it is.
fn shadowed_efer(ctx: &VmExitContext<'_>) -> u64 {
    let efer = ctx.platform.vmread(guest::IA32_EFER_FULL) & !EFER_SCE;
    if ctx.vcpu.shadow_efer_sce {
        efer | EFER_SCE
    } else {
        efer
    }
}

fn fault(ctx: &mut VmExitContext<'_>) {
    log::trace!("MSR {:#x} raised #GP", ctx.registers.rcx as u32);
    EventInjection::inject_gp(ctx.platform, 0);
    ctx.vcpu.suppress_rip_increment();
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
        x86::vmx::vmcs::control,
    };

    #[test]
    fn test_read_of_missing_msr_injects_gp() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rcx: 0x1234, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        handle_msr_access(&mut ctx, MsrAccessType::Read);
        assert!(!ctx.vcpu.increment_rip);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0xFF, 13);
    }

    #[test]
    fn test_write_reaches_msr_and_event_fires() {
        let (platform, state) = setup(1);
        platform.set_msr(0xC000_0082, 0);

        let mut descriptor = EventDescriptor::new(EventType::WrmsrInstructionExecution);
        descriptor.params[0] = 0xC000_0082;
        let tag = register_event(&platform, &state, descriptor, vec![]).unwrap();

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rcx: 0xC000_0082, rax: 0x8000_1000, rdx: 0xFFFF_F800, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        handle_msr_access(&mut ctx, MsrAccessType::Write);
        assert_eq!(platform.msr(0xC000_0082), Some(0xFFFF_F800_8000_1000));
        assert_eq!(state.events.find(tag).unwrap().hit_count(), 1);
    }
}
