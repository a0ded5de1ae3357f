//! Handles `vmcall`.
//!
//! A `vmcall` is one of three things: the jump of a detour hook into the hypervisor, a request
//! from the debugger's own kernel component (recognized by the signature in R10), or an
//! instruction executed by some other guest code. Requests carry their code in RCX and up to
//! three parameters in RDX, R8 and R9; the status comes back in RAX.

use crate::{
    debugger::{
        events::{trigger, EventType},
        hooks,
    },
    error::HypervisorError,
    intel::{events::EventInjection, invept::InveptType, vcpu::Interception, vmexit::VmExitContext},
};

/// Identifies requests issued by the debugger itself.
pub const VMCALL_SIGNATURE: u64 = 0x4856_4653;

pub const STATUS_SUCCESS: u64 = 0;
pub const STATUS_UNSUCCESSFUL: u64 = 0xC000_0001;

/// Request codes passed in RCX.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmcallCode {
    Test = 0x1,
    Vmxoff = 0x2,
    InveptAllContexts = 0x4,
    InveptSingleContext = 0x5,
    UnhookSinglePage = 0x7,
    ChangeMsrBitmapRead = 0xA,
    ChangeMsrBitmapWrite = 0xB,
    EnableRdtscExiting = 0xC,
    EnableRdpmcExiting = 0xD,
    SetExceptionBitmap = 0xE,
    EnableMovToDebugRegsExiting = 0xF,
    EnableExternalInterruptExiting = 0x10,
    ChangeIoBitmap = 0x11,
    DisableRdtscExiting = 0x13,
    DisableExternalInterruptExiting = 0x14,
    DisableRdpmcExiting = 0x15,
    DisableMovToDebugRegsExiting = 0x16,
    EnableMovToCr3Exiting = 0x1B,
    DisableMovToCr3Exiting = 0x1C,
    UnsetExceptionBitmap = 0x1D,
    EnableMovToCrExiting = 0x2B,
    DisableMovToCrExiting = 0x2C,
}

impl VmcallCode {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0x1 => Self::Test,
            0x2 => Self::Vmxoff,
            0x4 => Self::InveptAllContexts,
            0x5 => Self::InveptSingleContext,
            0x7 => Self::UnhookSinglePage,
            0xA => Self::ChangeMsrBitmapRead,
            0xB => Self::ChangeMsrBitmapWrite,
            0xC => Self::EnableRdtscExiting,
            0xD => Self::EnableRdpmcExiting,
            0xE => Self::SetExceptionBitmap,
            0xF => Self::EnableMovToDebugRegsExiting,
            0x10 => Self::EnableExternalInterruptExiting,
            0x11 => Self::ChangeIoBitmap,
            0x13 => Self::DisableRdtscExiting,
            0x14 => Self::DisableExternalInterruptExiting,
            0x15 => Self::DisableRdpmcExiting,
            0x16 => Self::DisableMovToDebugRegsExiting,
            0x1B => Self::EnableMovToCr3Exiting,
            0x1C => Self::DisableMovToCr3Exiting,
            0x1D => Self::UnsetExceptionBitmap,
            0x2B => Self::EnableMovToCrExiting,
            0x2C => Self::DisableMovToCrExiting,
            _ => return None,
        })
    }
}

/// Handles a `vmcall` exit.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.3 VMX Instructions: VMCALL
pub fn handle_vmcall(ctx: &mut VmExitContext<'_>) {
    if hooks::handle_detour(ctx) {
        return;
    }

    if ctx.registers.r10 == VMCALL_SIGNATURE {
        if let Some(code) = VmcallCode::from_u64(ctx.registers.rcx) {
            let status = match handle_request(ctx, code) {
                Ok(()) => STATUS_SUCCESS,
                Err(error) => {
                    log::warn!("vmcall {:?} failed: {}", code, error);
                    STATUS_UNSUCCESSFUL
                }
            };
            ctx.registers.rax = status;
            return;
        }
        log::warn!("Unknown vmcall code {:#x}", ctx.registers.rcx);
    }

    let code = ctx.registers.rcx;
    trigger::dispatch(ctx, EventType::VmcallInstructionExecution, code, &|_| true, |ctx| {
        // A processor without VMX support raises #UD here.
        EventInjection::inject_ud(ctx.platform);
        ctx.vcpu.suppress_rip_increment();
    });
}

fn handle_request(ctx: &mut VmExitContext<'_>, code: VmcallCode) -> Result<(), HypervisorError> {
    let (platform, state) = (ctx.platform, ctx.state);
    let core = ctx.core();
    let resources = &state.resources;
    let (param1, param2) = (ctx.registers.rdx, ctx.registers.r8);
    log::trace!("vmcall {:?} ({:#x}, {:#x}) on processor {}", code, param1, param2, core);

    match code {
        VmcallCode::Test => {
            log::info!("vmcall test: {:#x} {:#x} {:#x}", param1, param2, ctx.registers.r9);
            Ok(())
        }
        VmcallCode::Vmxoff => {
            ctx.vcpu.vmxoff_requested = true;
            Ok(())
        }
        VmcallCode::InveptAllContexts => {
            platform.invept(InveptType::AllContexts, 0);
            Ok(())
        }
        VmcallCode::InveptSingleContext => {
            let eptp = match param1 {
                0 => state.ept.lock().eptp(),
                eptp => eptp,
            };
            platform.invept(InveptType::SingleContext, eptp);
            Ok(())
        }
        VmcallCode::UnhookSinglePage => hooks::remove_hook_at(platform, state, ctx.guest_cr3(), param1),
        VmcallCode::ChangeMsrBitmapRead => resources.acquire(platform, core, Interception::MsrRead(msr(param1))),
        VmcallCode::ChangeMsrBitmapWrite => resources.acquire(platform, core, Interception::MsrWrite(msr(param1))),
        VmcallCode::ChangeIoBitmap => resources.acquire(platform, core, Interception::IoPort(port(param1))),
        VmcallCode::SetExceptionBitmap => resources.acquire(platform, core, Interception::Exception(vector(param1)?)),
        VmcallCode::UnsetExceptionBitmap => {
            resources.release(platform, core, Interception::Exception(vector(param1)?));
            Ok(())
        }
        VmcallCode::EnableRdtscExiting => resources.acquire(platform, core, Interception::RdtscExiting),
        VmcallCode::EnableRdpmcExiting => resources.acquire(platform, core, Interception::RdpmcExiting),
        VmcallCode::EnableMovToDebugRegsExiting => resources.acquire(platform, core, Interception::MovDrExiting),
        VmcallCode::EnableExternalInterruptExiting => resources.acquire(platform, core, Interception::ExternalInterruptExiting),
        VmcallCode::EnableMovToCr3Exiting => resources.acquire(platform, core, Interception::CrWrite(3)),
        VmcallCode::EnableMovToCrExiting => resources.acquire(platform, core, Interception::CrWrite(control_register(param1)?)),
        VmcallCode::DisableRdtscExiting
        | VmcallCode::DisableRdpmcExiting
        | VmcallCode::DisableMovToDebugRegsExiting
        | VmcallCode::DisableExternalInterruptExiting
        | VmcallCode::DisableMovToCr3Exiting
        | VmcallCode::DisableMovToCrExiting => {
            let interception = match code {
                VmcallCode::DisableRdtscExiting => Interception::RdtscExiting,
                VmcallCode::DisableRdpmcExiting => Interception::RdpmcExiting,
                VmcallCode::DisableMovToDebugRegsExiting => Interception::MovDrExiting,
                VmcallCode::DisableExternalInterruptExiting => Interception::ExternalInterruptExiting,
                VmcallCode::DisableMovToCr3Exiting => Interception::CrWrite(3),
                _ => Interception::CrWrite(control_register(param1)?),
            };
            resources.release(platform, core, interception);
            Ok(())
        }
    }
}

/// An all-ones parameter selects every MSR, port or vector.
fn msr(param: u64) -> Option<u32> {
    u32::try_from(param).ok().filter(|&msr| msr != u32::MAX)
}

fn port(param: u64) -> Option<u16> {
    u16::try_from(param).ok()
}

fn vector(param: u64) -> Result<Option<u8>, HypervisorError> {
    match param {
        0xFFFF_FFFF => Ok(None),
        0..=31 => Ok(Some(param as u8)),
        _ => Err(HypervisorError::BadEventDescriptor),
    }
}

fn control_register(param: u64) -> Result<u8, HypervisorError> {
    match param {
        0 | 3 | 4 | 8 => Ok(param as u8),
        _ => Err(HypervisorError::BadEventDescriptor),
    }
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

    fn request(code: VmcallCode, param: u64) -> GuestRegisters {
        GuestRegisters { rcx: code as u64, rdx: param, r10: VMCALL_SIGNATURE, ..Default::default() }
    }

    #[test]
    fn test_signed_requests_change_interceptions() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();

        let mut registers = request(VmcallCode::EnableRdtscExiting, 0);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert_eq!(registers.rax, STATUS_SUCCESS);
        assert_eq!(state.resources.count(0, Interception::RdtscExiting), 1);

        let mut registers = request(VmcallCode::SetExceptionBitmap, 14);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert_eq!(state.resources.count(0, Interception::Exception(Some(14))), 1);

        let mut registers = request(VmcallCode::DisableRdtscExiting, 0);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert_eq!(state.resources.count(0, Interception::RdtscExiting), 0);

        let mut registers = request(VmcallCode::EnableMovToCrExiting, 2);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert_eq!(registers.rax, STATUS_UNSUCCESSFUL);
    }

    #[test]
    fn test_invept_and_vmxoff() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let before = platform.invept_count();

        let mut registers = request(VmcallCode::InveptAllContexts, 0);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert_eq!(platform.invept_count(), before + 1);

        let mut registers = request(VmcallCode::Vmxoff, 0);
        handle_vmcall(&mut VmExitContext::new(&platform, &state, &mut vcpu, &mut registers));
        assert!(vcpu.vmxoff_requested);
    }

    #[test]
    fn test_foreign_vmcall_raises_ud() {
        let (platform, state) = setup(1);
        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rcx: 0x1, ..Default::default() };

        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_vmcall(&mut ctx);
        assert!(!ctx.vcpu.increment_rip);
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0xFF, 6);
    }

    #[test]
    fn test_vmcall_event_sees_foreign_calls() {
        let (platform, state) = setup(1);
        let tag = register_event(&platform, &state, EventDescriptor::new(EventType::VmcallInstructionExecution), vec![]).unwrap();

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rcx: 0x77, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        handle_vmcall(&mut ctx);

        assert_eq!(state.events.find(tag).unwrap().hit_count(), 1);
        // Without a short-circuit the guest still sees #UD.
        assert_eq!(platform.vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD) & 0xFF, 6);
    }
}
