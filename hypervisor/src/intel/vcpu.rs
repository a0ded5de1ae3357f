//! Per-processor VMM state.
//!
//! One `VcpuState` exists per logical processor. It is only touched by its own processor while
//! in VMX root; other processors request changes through the interception counts in
//! `debugger::events::resources`, which the owner applies at the start of its next VM exit.

use {
    crate::{
        debugger::{debug_registers::DebugRegisterState, events::EventType, stepping::PendingStep},
        error::HypervisorError,
        intel::{
            bitmap::{IoBitmap, MsrAccess, MsrBitmap},
            controls::{adjust_vmx_controls, VmxControl},
        },
        platform::Platform,
    },
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    x86::{
        msr::IA32_EFER,
        vmx::vmcs::{
            control::{self, PinbasedControls, PrimaryControls},
            guest,
        },
    },
};

/// EFER.SCE, cleared while syscall/sysret are trapped through #UD.
pub const EFER_SCE: u64 = 1 << 0;

/// Upper bound on external interrupts held back during a guaranteed step.
const MAX_HELD_INTERRUPTS: usize = 32;

/// A VM-exit facility that events and debugger features switch on and off.
///
/// Each one is reference counted per processor; the VMCS bit flips on 0 <-> 1 transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interception {
    /// A bit of the exception bitmap, or every bit for `None`.
    Exception(Option<u8>),
    RdtscExiting,
    RdpmcExiting,
    ExternalInterruptExiting,
    MovDrExiting,
    /// MOV to CR0, CR3, CR4 or CR8.
    CrWrite(u8),
    /// MOV from CR3 or CR8.
    CrRead(u8),
    MsrRead(Option<u32>),
    MsrWrite(Option<u32>),
    IoPort(Option<u16>),
    /// Clears EFER.SCE so that syscall and sysret raise #UD.
    SyscallEfer,
    /// Single-steps with MTF to observe user/kernel transitions.
    ModeTrap,
    /// Single-steps with MTF to report every executed instruction.
    InstructionTrace,
}

impl Interception {
    /// Rejects interceptions the processor cannot provide.
    pub fn validate(self) -> Result<(), HypervisorError> {
        match self {
            Interception::Exception(Some(vector)) if vector >= 32 => Err(HypervisorError::BadEventDescriptor),
            Interception::CrWrite(0 | 3 | 4 | 8) | Interception::CrRead(3 | 8) => Ok(()),
            // Reads of CR0 and CR4 are served from the read shadows and never exit.
            Interception::CrWrite(_) | Interception::CrRead(_) => Err(HypervisorError::CouldNotActivateInterception),
            _ => Ok(()),
        }
    }
}

/// Monitor trap flag bookkeeping.
#[derive(Debug, Default, Copy, Clone)]
pub struct MtfState {
    /// MTF was armed by the debugger and the next MTF exit belongs to it.
    pub registered: bool,

    /// Leave MTF set after the MTF exit is handled.
    pub ignore_mtf_unset: bool,

    /// Swallow the next MTF exit without any processing.
    pub ignore_one_mtf: bool,
}

/// A post-stage trigger held back until the access that caused it has completed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeferredPostEvent {
    pub tag: u64,
    pub event_type: EventType,
    pub context: u64,
}

/// Control values written at VMCS setup that the interception logic builds upon.
#[derive(Debug, Default, Copy, Clone)]
pub struct BaseControls {
    pub primary: u32,
    pub pin: u32,
    pub exception_bitmap: u32,
}

/// Per-processor state of the VMM.
pub struct VcpuState {
    /// The processor's unique identifier.
    pub index: u32,

    pub msr_bitmap: Box<MsrBitmap>,
    pub io_bitmap: Box<IoBitmap>,

    pub base: BaseControls,

    /// True exactly while a VM-exit handler runs on this processor.
    pub is_on_vmx_root: bool,

    /// Whether RIP advances past the exiting instruction. Reset to true on every exit.
    pub increment_rip: bool,

    pub last_vmexit_rip: u64,

    /// An NMI or a zero preemption timer was used to force an exit.
    pub waiting_for_immediate_exit: bool,

    /// Instruction tracing through MTF is active.
    pub tracing: bool,

    pub mtf: MtfState,

    /// A pre-stage trigger found events that also want the post stage.
    pub post_event_required: bool,

    /// Hooked pages whose resting EPT entry is restored once the MTF step over an access to
    /// their original contents completes.
    pub pending_ept_restore: Vec<u64>,

    pub deferred_post_events: Vec<DeferredPostEvent>,

    /// Breakpoint address to re-arm after stepping over its original instruction.
    pub pending_breakpoint_rearm: Option<u64>,

    /// CS selector at the start of a guaranteed step.
    pub last_cs: u16,

    pub step: Option<PendingStep>,

    pub debug_registers: DebugRegisterState,

    /// External interrupts are held back while a guaranteed step executes.
    pub hold_interrupts: bool,
    pub held_interrupts: Vec<u8>,

    /// EFER.SCE as the guest believes it is while syscall trapping hides it.
    pub shadow_efer_sce: bool,
    syscall_trap_active: bool,

    /// The guest asked to leave VMX operation; the launch loop turns VMX off after this exit.
    pub vmxoff_requested: bool,

    /// Short-circuit state the debugger chose while halted on an event.
    pub debugger_short_circuit: Option<bool>,
}

impl VcpuState {
    /// Allocates the per-processor bitmaps.
    ///
    /// # Arguments
    ///
    /// * `index` - Processor's unique identifier.
    pub fn new(index: u32) -> Result<Self, HypervisorError> {
        log::trace!("Creating processor {}", index);

        Ok(Self {
            index,
            msr_bitmap: MsrBitmap::new()?,
            io_bitmap: IoBitmap::new()?,
            base: BaseControls::default(),
            is_on_vmx_root: false,
            increment_rip: true,
            last_vmexit_rip: 0,
            waiting_for_immediate_exit: false,
            tracing: false,
            mtf: MtfState::default(),
            post_event_required: false,
            pending_ept_restore: Vec::new(),
            deferred_post_events: Vec::new(),
            pending_breakpoint_rearm: None,
            last_cs: 0,
            step: None,
            debug_registers: DebugRegisterState::default(),
            hold_interrupts: false,
            held_interrupts: Vec::new(),
            shadow_efer_sce: true,
            syscall_trap_active: false,
            vmxoff_requested: false,
            debugger_short_circuit: None,
        })
    }

    /// Prevents the RIP advance for the current exit.
    pub fn suppress_rip_increment(&mut self) {
        self.increment_rip = false;
    }

    pub fn perform_rip_increment(&mut self) {
        self.increment_rip = true;
    }

    /// Sets or clears the monitor trap flag in the primary processor-based controls.
    pub fn set_monitor_trap_flag(&self, platform: &dyn Platform, enabled: bool) {
        let mut primary = platform.vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
        if enabled {
            primary |= PrimaryControls::MONITOR_TRAP_FLAG.bits();
        } else {
            primary &= !PrimaryControls::MONITOR_TRAP_FLAG.bits();
        }
        platform.vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(primary));
    }

    /// Whether MTF must stay set after an MTF exit was handled.
    pub fn wants_monitor_trap_flag(&self) -> bool {
        self.tracing || self.mtf.ignore_mtf_unset || self.step.is_some()
    }

    pub fn set_interrupt_window_exiting(&self, platform: &dyn Platform, enabled: bool) {
        let mut primary = platform.vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
        if enabled {
            primary |= PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
        } else {
            primary &= !PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
        }
        platform.vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(primary));
    }

    /// Holds back external interrupts until [`Self::release_interrupts`] is called.
    pub fn hold_interrupts(&mut self, platform: &dyn Platform, interceptions: &BTreeMap<Interception, u32>) {
        self.hold_interrupts = true;
        self.set_interrupt_window_exiting(platform, false);
        self.apply_interceptions(platform, interceptions);
    }

    /// Queues an interrupt that arrived while interrupts are held. Returns false when the queue is
    /// full and the interrupt must be delivered now.
    pub fn queue_held_interrupt(&mut self, vector: u8) -> bool {
        if self.held_interrupts.len() >= MAX_HELD_INTERRUPTS {
            return false;
        }
        self.held_interrupts.push(vector);
        true
    }

    /// Stops holding interrupts and asks for an interrupt window if some are queued.
    pub fn release_interrupts(&mut self, platform: &dyn Platform, interceptions: &BTreeMap<Interception, u32>) {
        self.hold_interrupts = false;
        self.apply_interceptions(platform, interceptions);
        if !self.held_interrupts.is_empty() {
            self.set_interrupt_window_exiting(platform, true);
        }
    }

    /// Recomputes every interception-driven VMCS control and bitmap from the active counts.
    ///
    /// Idempotent: the result only depends on the counts and on the base controls.
    #[rustfmt::skip]
    pub fn apply_interceptions(&mut self, platform: &dyn Platform, interceptions: &BTreeMap<Interception, u32>) {
        const OWNED_PRIMARY: u32 = PrimaryControls::RDTSC_EXITING.bits()
            | PrimaryControls::RDPMC_EXITING.bits()
            | PrimaryControls::MOV_DR_EXITING.bits()
            | PrimaryControls::CR3_LOAD_EXITING.bits()
            | PrimaryControls::CR3_STORE_EXITING.bits()
            | PrimaryControls::CR8_LOAD_EXITING.bits()
            | PrimaryControls::CR8_STORE_EXITING.bits();

        let current_primary = platform.vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
        let mut primary = (current_primary & !OWNED_PRIMARY) | (self.base.primary & OWNED_PRIMARY);
        let mut pin = self.base.pin;
        let mut exception_bitmap = self.base.exception_bitmap;
        let mut cr0_mask = 0u64;
        let mut cr4_mask = 0u64;
        let mut syscall_trap = false;
        let mut tracing = false;

        self.msr_bitmap.set_all(MsrAccess::Read, false);
        self.msr_bitmap.set_all(MsrAccess::Write, false);
        self.io_bitmap.set_all(false);

        for interception in interceptions.iter().filter(|(_, count)| **count > 0).map(|(interception, _)| *interception) {
            match interception {
                Interception::Exception(Some(vector)) => exception_bitmap |= 1 << (vector & 31),
                Interception::Exception(None) => exception_bitmap = u32::MAX,
                Interception::RdtscExiting => primary |= PrimaryControls::RDTSC_EXITING.bits(),
                Interception::RdpmcExiting => primary |= PrimaryControls::RDPMC_EXITING.bits(),
                Interception::ExternalInterruptExiting => pin |= PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits(),
                Interception::MovDrExiting => primary |= PrimaryControls::MOV_DR_EXITING.bits(),
                Interception::CrWrite(0) => cr0_mask = u64::MAX,
                Interception::CrWrite(3) => primary |= PrimaryControls::CR3_LOAD_EXITING.bits(),
                Interception::CrWrite(4) => cr4_mask = u64::MAX,
                Interception::CrWrite(8) => primary |= PrimaryControls::CR8_LOAD_EXITING.bits(),
                Interception::CrRead(3) => primary |= PrimaryControls::CR3_STORE_EXITING.bits(),
                Interception::CrRead(8) => primary |= PrimaryControls::CR8_STORE_EXITING.bits(),
                Interception::CrWrite(_) | Interception::CrRead(_) => {}
                Interception::MsrRead(Some(msr)) => self.msr_bitmap.set(msr, MsrAccess::Read, true),
                Interception::MsrRead(None) => self.msr_bitmap.set_all(MsrAccess::Read, true),
                Interception::MsrWrite(Some(msr)) => self.msr_bitmap.set(msr, MsrAccess::Write, true),
                Interception::MsrWrite(None) => self.msr_bitmap.set_all(MsrAccess::Write, true),
                Interception::IoPort(Some(port)) => self.io_bitmap.set(port, true),
                Interception::IoPort(None) => self.io_bitmap.set_all(true),
                Interception::SyscallEfer => syscall_trap = true,
                Interception::ModeTrap | Interception::InstructionTrace => tracing = true,
            }
        }

        if self.hold_interrupts {
            pin |= PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits();
        }

        if syscall_trap {
            exception_bitmap |= 1 << 6;
            self.msr_bitmap.set(IA32_EFER, MsrAccess::Read, true);
            self.msr_bitmap.set(IA32_EFER, MsrAccess::Write, true);
        }
        self.set_syscall_trap(platform, syscall_trap);

        platform.vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(platform, VmxControl::ProcessorBased, u64::from(primary)));
        platform.vmwrite(control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(platform, VmxControl::PinBased, u64::from(pin)));
        platform.vmwrite(control::EXCEPTION_BITMAP, u64::from(exception_bitmap));

        Self::apply_cr_mask(platform, control::CR0_GUEST_HOST_MASK, control::CR0_READ_SHADOW, guest::CR0, cr0_mask);
        Self::apply_cr_mask(platform, control::CR4_GUEST_HOST_MASK, control::CR4_READ_SHADOW, guest::CR4, cr4_mask);

        if tracing != self.tracing {
            self.tracing = tracing;
            self.set_monitor_trap_flag(platform, self.wants_monitor_trap_flag() || self.mtf.registered);
        }

        log::trace!("Processor {} interceptions applied, exception bitmap {:#x}", self.index, exception_bitmap);
    }

    /// Makes every write of the control register exit when `mask` is all ones, keeping the read
    /// shadow equal to the value the guest sees.
    fn apply_cr_mask(platform: &dyn Platform, mask_field: u32, shadow_field: u32, guest_field: u32, mask: u64) {
        let previous_mask = platform.vmread(mask_field);
        if previous_mask == mask {
            return;
        }

        if mask != 0 {
            platform.vmwrite(shadow_field, platform.vmread(guest_field));
        }
        platform.vmwrite(mask_field, mask);
    }

    /// Hides EFER.SCE from the processor while keeping the guest's view in the shadow.
    fn set_syscall_trap(&mut self, platform: &dyn Platform, enabled: bool) {
        if enabled == self.syscall_trap_active {
            return;
        }

        let efer = platform.vmread(guest::IA32_EFER_FULL);
        if enabled {
            self.shadow_efer_sce = efer & EFER_SCE != 0;
            platform.vmwrite(guest::IA32_EFER_FULL, efer & !EFER_SCE);
        } else if self.shadow_efer_sce {
            platform.vmwrite(guest::IA32_EFER_FULL, efer | EFER_SCE);
        }

        self.syscall_trap_active = enabled;
    }

    pub fn syscall_trap_active(&self) -> bool {
        self.syscall_trap_active
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    fn permissive_platform() -> MockPlatform {
        let platform = MockPlatform::new(1);
        platform.set_msr(x86::msr::IA32_VMX_BASIC, 0);
        platform.set_msr(x86::msr::IA32_VMX_PROCBASED_CTLS, 0xFFFF_FFFF_0000_0000);
        platform.set_msr(x86::msr::IA32_VMX_PINBASED_CTLS, 0xFFFF_FFFF_0000_0000);
        platform
    }

    #[test]
    fn test_apply_is_idempotent_and_reversible() {
        let platform = permissive_platform();
        let mut vcpu = VcpuState::new(0).unwrap();

        let mut counts = BTreeMap::new();
        counts.insert(Interception::Exception(Some(3)), 1);
        counts.insert(Interception::RdtscExiting, 2);
        counts.insert(Interception::MsrRead(Some(0xC000_0082)), 1);

        vcpu.apply_interceptions(&platform, &counts);
        vcpu.apply_interceptions(&platform, &counts);

        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 1 << 3);
        assert_ne!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32 & PrimaryControls::RDTSC_EXITING.bits(), 0);
        assert!(vcpu.msr_bitmap.intercepts(0xC000_0082, MsrAccess::Read));

        counts.clear();
        vcpu.apply_interceptions(&platform, &counts);

        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 0);
        assert_eq!(platform.vmcs(control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32 & PrimaryControls::RDTSC_EXITING.bits(), 0);
        assert!(!vcpu.msr_bitmap.intercepts(0xC000_0082, MsrAccess::Read));
    }

    #[test]
    fn test_cr0_write_interception_uses_shadow() {
        let platform = permissive_platform();
        platform.set_vmcs(guest::CR0, 0x8005_0033);
        let mut vcpu = VcpuState::new(0).unwrap();

        let mut counts = BTreeMap::new();
        counts.insert(Interception::CrWrite(0), 1);
        vcpu.apply_interceptions(&platform, &counts);

        assert_eq!(platform.vmcs(control::CR0_GUEST_HOST_MASK), u64::MAX);
        assert_eq!(platform.vmcs(control::CR0_READ_SHADOW), 0x8005_0033);
    }

    #[test]
    fn test_syscall_trap_hides_sce() {
        let platform = permissive_platform();
        platform.set_vmcs(guest::IA32_EFER_FULL, 0xD01);
        let mut vcpu = VcpuState::new(0).unwrap();

        let mut counts = BTreeMap::new();
        counts.insert(Interception::SyscallEfer, 1);
        vcpu.apply_interceptions(&platform, &counts);

        assert_eq!(platform.vmcs(guest::IA32_EFER_FULL), 0xD00);
        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 1 << 6);
        assert!(vcpu.shadow_efer_sce);

        counts.clear();
        vcpu.apply_interceptions(&platform, &counts);
        assert_eq!(platform.vmcs(guest::IA32_EFER_FULL), 0xD01);
    }

    #[test]
    fn test_cr_read_of_cr0_is_rejected() {
        assert_eq!(Interception::CrRead(0).validate(), Err(HypervisorError::CouldNotActivateInterception));
        assert_eq!(Interception::Exception(Some(32)).validate(), Err(HypervisorError::BadEventDescriptor));
        assert!(Interception::CrWrite(8).validate().is_ok());
    }
}
