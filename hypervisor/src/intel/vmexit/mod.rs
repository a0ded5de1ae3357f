//! A module providing utilities and structures for handling VM exits.
//!
//! This module focuses on the reasons for VM exits and the associated handlers for each exit type.
//! The handlers interpret and respond to different VM exit reasons, run the debug events bound to
//! them and decide whether the guest's RIP moves past the exiting instruction.

use {
    crate::{
        debugger::{
            session::{self, PausingReason},
            stepping,
        },
        error::HypervisorError,
        intel::{events::EventInjection, registers::GuestRegisters, vcpu::VcpuState, vmerror::VmxBasicExitReason},
        memory::mapper,
        platform::Platform,
        CoreState,
    },
    x86::vmx::vmcs::{guest, ro},
};

pub mod cpuid;
pub mod cr;
pub mod dr;
pub mod ept;
pub mod exception;
pub mod interrupt;
pub mod io;
pub mod msr;
pub mod mtf;
pub mod rdtsc;
pub mod syscall;
pub mod vmcall;
pub mod xsetbv;

/// Everything a handler can touch while the processor is in VMX root.
pub struct VmExitContext<'a> {
    pub platform: &'a dyn Platform,
    pub state: &'a CoreState,
    pub vcpu: &'a mut VcpuState,
    pub registers: &'a mut GuestRegisters,
}

impl<'a> VmExitContext<'a> {
    pub fn new(platform: &'a dyn Platform, state: &'a CoreState, vcpu: &'a mut VcpuState, registers: &'a mut GuestRegisters) -> Self {
        Self { platform, state, vcpu, registers }
    }

    /// The processor handling the exit.
    pub fn core(&self) -> u32 {
        self.vcpu.index
    }

    /// The guest's current CR3.
    pub fn guest_cr3(&self) -> u64 {
        mapper::guest_cr3(self.platform)
    }
}

/// Handles the VM-exit.
///
/// This function interprets the VM exit reason and invokes the appropriate handler based on the exit type.
/// Guest RIP, RSP and RFLAGS are loaded from the VMCS into `registers` before the handler runs and
/// written back afterwards, so handlers only ever modify `registers`.
///
/// # Arguments
///
/// * `platform` - The processor the exit happened on.
/// * `state` - The engine state shared by every processor.
/// * `registers` - A mutable reference to the guest's current register state.
///
/// # Returns
///
/// Ok once the guest can be resumed, or an error if the VM exit reason is unknown.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9 VM-EXIT INFORMATION FIELDS
/// - APPENDIX C VMX BASIC EXIT REASONS
/// - Table C-1. Basic Exit Reasons
pub fn handle_vmexit(platform: &dyn Platform, state: &CoreState, registers: &mut GuestRegisters) -> Result<(), HypervisorError> {
    let core = platform.current_core();
    let vcpu_slot = state.vcpus.get(core as usize).ok_or(HypervisorError::NotInitialized)?;
    let mut vcpu = vcpu_slot.lock();

    state.resources.enter_root(core);
    vcpu.is_on_vmx_root = true;
    vcpu.increment_rip = true;

    registers.rip = platform.vmread(guest::RIP);
    registers.rsp = platform.vmread(guest::RSP);
    registers.rflags = platform.vmread(guest::RFLAGS);
    vcpu.last_vmexit_rip = registers.rip;

    let mut ctx = VmExitContext::new(platform, state, &mut vcpu, registers);
    let result = dispatch(&mut ctx);

    if ctx.vcpu.increment_rip {
        advance_guest_rip(&mut ctx);
    }

    session::park_if_requested(&mut ctx);
    stepping::sync_step_over(&mut ctx);

    platform.vmwrite(guest::RIP, ctx.registers.rip);
    platform.vmwrite(guest::RSP, ctx.registers.rsp);
    platform.vmwrite(guest::RFLAGS, ctx.registers.rflags);

    ctx.vcpu.is_on_vmx_root = false;
    state.resources.leave_root(platform, ctx.vcpu);

    result
}

fn dispatch(ctx: &mut VmExitContext<'_>) -> Result<(), HypervisorError> {
    let platform = ctx.platform;
    ctx.state.resources.apply(platform, ctx.vcpu);
    ctx.state.pool.reclaim(platform, ctx.state.resources.completed_generation());

    let exit_reason = platform.vmread(ro::EXIT_REASON) as u32;
    let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit_reason) else {
        log::error!("Unknown exit reason: {:#x}", exit_reason);
        return Err(HypervisorError::UnknownVmExitReason);
    };
    log::trace!("Processor {} exit: {:?} at {:#x}", ctx.core(), basic_exit_reason, ctx.registers.rip);

    // Handle VMEXIT
    // Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.2 Instructions That Cause VM Exits Unconditionally:
    // - The following instructions cause VM exits when they are executed in VMX non-root operation: CPUID, GETSEC, INVD, and XSETBV.
    // - This is also true of instructions introduced with VMX, which include: INVEPT, INVVPID, VMCALL, VMCLEAR, VMLAUNCH, VMPTRLD, VMPTRST, VMRESUME, VMXOFF, and VMXON.
    //
    // 26.1.3 Instructions That Cause VM Exits Conditionally: Certain instructions cause VM exits in VMX non-root operation depending on the setting of the VM-execution controls.
    match basic_exit_reason {
        VmxBasicExitReason::ExceptionOrNmi => exception::handle_exception(ctx),
        VmxBasicExitReason::ExternalInterrupt => interrupt::handle_external_interrupt(ctx),
        VmxBasicExitReason::InterruptWindow => interrupt::handle_interrupt_window(ctx),
        VmxBasicExitReason::NmiWindow => interrupt::handle_nmi_window(ctx),
        VmxBasicExitReason::Cpuid => cpuid::handle_cpuid(ctx),
        VmxBasicExitReason::Rdmsr => msr::handle_msr_access(ctx, msr::MsrAccessType::Read),
        VmxBasicExitReason::Wrmsr => msr::handle_msr_access(ctx, msr::MsrAccessType::Write),
        VmxBasicExitReason::Rdtsc => rdtsc::handle_rdtsc(ctx, false),
        VmxBasicExitReason::Rdtscp => rdtsc::handle_rdtsc(ctx, true),
        VmxBasicExitReason::Rdpmc => rdtsc::handle_rdpmc(ctx),
        VmxBasicExitReason::IoInstruction => io::handle_io(ctx),
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_access(ctx),
        VmxBasicExitReason::MovDr => dr::handle_dr_access(ctx),
        VmxBasicExitReason::MonitorTrapFlag => mtf::handle_monitor_trap_flag(ctx),
        VmxBasicExitReason::EptViolation => ept::handle_ept_violation(ctx),
        VmxBasicExitReason::EptMisconfiguration => ept::handle_ept_misconfiguration(ctx),
        VmxBasicExitReason::Vmcall => vmcall::handle_vmcall(ctx),
        VmxBasicExitReason::Xsetbv => xsetbv::handle_xsetbv(ctx),
        VmxBasicExitReason::Invd | VmxBasicExitReason::WbinvdOrWbnoinvd => platform.wbinvd(),
        VmxBasicExitReason::Hlt => {}
        VmxBasicExitReason::TaskSwitch => log::warn!("Task switch at {:#x} passed through", ctx.registers.rip),
        VmxBasicExitReason::VmxPreemptionTimerExpired => {
            ctx.vcpu.waiting_for_immediate_exit = false;
            ctx.vcpu.suppress_rip_increment();
        }
        VmxBasicExitReason::TripleFault => handle_triple_fault(ctx),
        VmxBasicExitReason::InitSignal | VmxBasicExitReason::StartupIpi => ctx.vcpu.suppress_rip_increment(),
        reason if reason.is_vmx_instruction() => {
            // VMX is not exposed to the guest; behave like a processor without it.
            EventInjection::inject_ud(platform);
            ctx.vcpu.suppress_rip_increment();
        }
        reason => {
            log::error!("Unhandled exit reason {:?} at {:#x}", reason, ctx.registers.rip);
            ctx.vcpu.suppress_rip_increment();
            return Err(HypervisorError::UnhandledVmExit);
        }
    }

    Ok(())
}

/// Dumps the guest state and halts for the debugger. There is no way to continue the guest.
fn handle_triple_fault(ctx: &mut VmExitContext<'_>) {
    ctx.vcpu.suppress_rip_increment();
    log::error!(
        "Triple fault on processor {}: rip {:#x} rsp {:#x} cr3 {:#x} last exit rip {:#x}",
        ctx.core(),
        ctx.registers.rip,
        ctx.registers.rsp,
        ctx.guest_cr3(),
        ctx.vcpu.last_vmexit_rip
    );

    let rip = ctx.registers.rip;
    session::halt(ctx, PausingReason::GeneralDebugBreak, 0, rip);
}

/// Advances the guest's instruction pointer (RIP) after a VM exit.
///
/// When a VM exit occurs, the guest's execution is interrupted, and control is transferred
/// to the hypervisor. To ensure that the guest does not re-execute the instruction that
/// caused the VM exit, the hypervisor needs to advance the guest's RIP to the next instruction.
#[rustfmt::skip]
fn advance_guest_rip(ctx: &mut VmExitContext<'_>) {
    let len = ctx.platform.vmread(ro::VMEXIT_INSTRUCTION_LEN);
    ctx.registers.rip = ctx.registers.rip.wrapping_add(len);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::debugger::events::tests::setup,
        x86::vmx::vmcs::control,
    };

    #[test]
    fn test_rip_advances_past_exiting_instruction() {
        let (platform, state) = setup(1);
        platform.set_vmcs(ro::EXIT_REASON, VmxBasicExitReason::Hlt as u64);
        platform.set_vmcs(ro::VMEXIT_INSTRUCTION_LEN, 1);
        platform.set_vmcs(guest::RIP, 0x4000);

        let mut registers = GuestRegisters::default();
        handle_vmexit(&platform, &state, &mut registers).unwrap();

        assert_eq!(platform.vmcs(guest::RIP), 0x4001);
        assert!(!state.resources.is_in_root(0));
    }

    #[test]
    fn test_vmx_instruction_raises_ud() {
        let (platform, state) = setup(1);
        platform.set_vmcs(ro::EXIT_REASON, VmxBasicExitReason::Vmxon as u64);
        platform.set_vmcs(ro::VMEXIT_INSTRUCTION_LEN, 4);
        platform.set_vmcs(guest::RIP, 0x4000);

        let mut registers = GuestRegisters::default();
        handle_vmexit(&platform, &state, &mut registers).unwrap();

        assert_eq!(platform.vmcs(guest::RIP), 0x4000);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0xFF, 6);
    }

    #[test]
    fn test_unknown_exit_reason_is_reported() {
        let (platform, state) = setup(1);
        platform.set_vmcs(ro::EXIT_REASON, 35);

        let mut registers = GuestRegisters::default();
        assert_eq!(handle_vmexit(&platform, &state, &mut registers), Err(HypervisorError::UnknownVmExitReason));
    }
}
