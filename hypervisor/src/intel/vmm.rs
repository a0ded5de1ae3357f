//! Bringing every processor into and out of VMX operation.
//!
//! The support checks run through [`Platform`] so they can be exercised anywhere. Virtualization
//! itself only exists in Windows kernel builds: each processor captures its own context, builds
//! a VMCS that resumes the guest at that exact point and executes VMLAUNCH.

use {
    crate::{error::HypervisorError, platform::Platform},
    x86::msr,
};

const CPUID_VMX: u32 = 1 << 5;
const CPUID_MTRR: u32 = 1 << 12;
const PROCBASED_SECONDARY_CONTROLS: u64 = 1 << 63;
const PROCBASED2_ENABLE_EPT: u64 = 1 << 33;
const EPT_PAGE_WALK_4: u64 = 1 << 6;
const EPT_WRITE_BACK: u64 = 1 << 14;
const EPT_2MB_PAGES: u64 = 1 << 16;
const EPT_INVEPT: u64 = 1 << 20;
const EPT_INVEPT_SINGLE_CONTEXT: u64 = 1 << 25;
const EPT_INVEPT_ALL_CONTEXTS: u64 = 1 << 26;

/// Verifies the processor offers everything the engine relies on: an Intel processor with VMX,
/// MTRRs, secondary controls, and EPT with 4-level walks, write-back paging structures, 2MB
/// pages and both INVEPT types.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX
pub fn check_supported_cpu(platform: &dyn Platform) -> Result<(), HypervisorError> {
    let vendor = platform.cpuid(0, 0);
    let mut vendor_id = [0u8; 12];
    vendor_id[0..4].copy_from_slice(&vendor.ebx.to_le_bytes());
    vendor_id[4..8].copy_from_slice(&vendor.edx.to_le_bytes());
    vendor_id[8..12].copy_from_slice(&vendor.ecx.to_le_bytes());
    if &vendor_id != b"GenuineIntel" {
        log::error!("Processor vendor is not Intel");
        return Err(HypervisorError::UnsupportedProcessor);
    }

    let features = platform.cpuid(1, 0);
    if features.ecx & CPUID_VMX == 0 {
        log::error!("VMX is not supported");
        return Err(HypervisorError::UnsupportedProcessor);
    }
    if features.edx & CPUID_MTRR == 0 {
        log::error!("MTRRs are not supported");
        return Err(HypervisorError::UnsupportedProcessor);
    }

    let procbased = platform.rdmsr(msr::IA32_VMX_PROCBASED_CTLS).unwrap_or(0);
    let procbased2 = platform.rdmsr(msr::IA32_VMX_PROCBASED_CTLS2).unwrap_or(0);
    if procbased & PROCBASED_SECONDARY_CONTROLS == 0 || procbased2 & PROCBASED2_ENABLE_EPT == 0 {
        log::error!("EPT is not supported");
        return Err(HypervisorError::UnsupportedProcessor);
    }

    const REQUIRED_EPT: u64 = EPT_PAGE_WALK_4 | EPT_WRITE_BACK | EPT_2MB_PAGES | EPT_INVEPT | EPT_INVEPT_SINGLE_CONTEXT | EPT_INVEPT_ALL_CONTEXTS;
    let ept_capabilities = platform.rdmsr(msr::IA32_VMX_EPT_VPID_CAP).unwrap_or(0);
    if ept_capabilities & REQUIRED_EPT != REQUIRED_EPT {
        log::error!("EPT capabilities {:#x} lack required features", ept_capabilities);
        return Err(HypervisorError::UnsupportedProcessor);
    }

    log::info!("Processor supports VMX with EPT");
    Ok(())
}

#[cfg(windows)]
pub use native::*;

#[cfg(windows)]
mod native {
    use {
        super::check_supported_cpu,
        crate::{
            error::HypervisorError,
            intel::{
                descriptor::DescriptorTables,
                idt::{self, HostIdt},
                registers::GuestRegisters,
                vmcs::{self, ControlAddresses, ProcessorSnapshot},
                vmexit::vmcall::{VmcallCode, STATUS_SUCCESS},
                vmlaunch::{launch, vmexit_stub},
                vmx::{enter_vmx_operation, leave_vmx_operation, VmxRegions},
            },
            platform::{native::NativePlatform, Platform},
            CoreState,
        },
        alloc::{boxed::Box, vec, vec::Vec},
        core::sync::atomic::{AtomicBool, Ordering},
        wdk_sys::{ntddk::RtlCaptureContext, CONTEXT},
        x86::msr,
    };

    const HOST_STACK_SIZE: usize = 0x6000;

    /// Offset of `Xmm0` in the x64 `CONTEXT` record.
    const CONTEXT_XMM0_OFFSET: usize = 0x1A0;

    /// What one processor needs while it runs under VMX.
    struct ProcessorResources {
        index: u32,
        regions: VmxRegions,
        host_stack: Box<[u8]>,
        registers: Box<GuestRegisters>,
        host_tables: Option<DescriptorTables>,
        virtualized: AtomicBool,
    }

    impl ProcessorResources {
        fn host_stack_top(&self) -> u64 {
            (self.host_stack.as_ptr() as u64 + self.host_stack.len() as u64) & !0xF
        }
    }

    /// Owns the VMX resources of every processor.
    pub struct Vmm {
        processors: Vec<ProcessorResources>,
        host_idt: Box<HostIdt>,
    }

    impl Vmm {
        /// Checks processor support and allocates the VMXON region, VMCS and host stack of every
        /// processor.
        pub fn new(platform: &NativePlatform) -> Result<Self, HypervisorError> {
            check_supported_cpu(platform)?;

            let mut processors = Vec::new();
            for index in 0..platform.processor_count() {
                let regions = match VmxRegions::allocate(platform) {
                    Ok(regions) => regions,
                    Err(error) => {
                        processors.into_iter().for_each(|processor: ProcessorResources| processor.regions.free(platform));
                        return Err(error);
                    }
                };

                processors.push(ProcessorResources {
                    index,
                    regions,
                    host_stack: vec![0u8; HOST_STACK_SIZE].into_boxed_slice(),
                    registers: Box::default(),
                    host_tables: None,
                    virtualized: AtomicBool::new(false),
                });
            }

            let code_selector = x86::segmentation::cs().bits() & 0xF8;
            log::info!("Allocated VMX resources for {} processors", processors.len());

            Ok(Self {
                processors,
                host_idt: idt::build(code_selector),
            })
        }

        /// Runs every processor under VMX. Processors already virtualized are skipped.
        pub fn virtualize_system(&mut self, platform: &NativePlatform, state: &'static CoreState) -> Result<(), HypervisorError> {
            log::info!("Virtualizing processors");
            let host_idtr = self.host_idt.register();

            for processor in self.processors.iter_mut() {
                let index = processor.index;
                platform.run_on_processor(index, || virtualize_current(platform, state, processor, host_idtr))??;
                log::info!("Processor {} virtualized", index);
            }

            Ok(())
        }

        /// Asks every virtualized processor to leave VMX operation.
        pub fn devirtualize_system(&mut self, platform: &NativePlatform) -> Result<(), HypervisorError> {
            log::info!("Devirtualizing processors");

            for processor in self.processors.iter_mut().filter(|processor| processor.virtualized.load(Ordering::Acquire)) {
                let status = platform.run_on_processor(processor.index, || platform.vmcall(VmcallCode::Vmxoff as u64, [0; 3]))?;
                if status != STATUS_SUCCESS {
                    log::error!("Processor {} refused to leave VMX operation: {:#x}", processor.index, status);
                    return Err(HypervisorError::VmxoffFailed);
                }
                processor.virtualized.store(false, Ordering::Release);
                log::info!("Processor {} devirtualized", processor.index);
            }

            Ok(())
        }

        /// Returns the VMX regions to the system. Every processor must have left VMX operation.
        pub fn free(self, platform: &NativePlatform) {
            for processor in self.processors {
                processor.regions.free(platform);
            }
        }
    }

    /// Virtualizes the current processor. Returns twice on success: the second return happens
    /// in the guest, right after the context capture.
    fn virtualize_current(platform: &NativePlatform, state: &'static CoreState, processor: &mut ProcessorResources, host_idtr: crate::intel::descriptor::TableRegister) -> Result<(), HypervisorError> {
        let mut context: CONTEXT = unsafe { core::mem::zeroed() };
        unsafe { RtlCaptureContext(&mut context) };

        if processor.virtualized.load(Ordering::Acquire) {
            return Ok(());
        }
        processor.virtualized.store(true, Ordering::Release);

        let snapshot = snapshot(platform, &context);
        let guest_tables = DescriptorTables::capture();
        let host_tables = processor.host_tables.insert(guest_tables.host_copy(host_idtr));

        if let Err(error) = enter_vmx_operation(platform, &processor.regions) {
            processor.virtualized.store(false, Ordering::Release);
            return Err(error);
        }

        vmcs::setup_guest_state(platform, &snapshot, &guest_tables);
        vmcs::setup_host_state(platform, &snapshot, host_tables, processor.host_stack_top(), vmexit_stub as usize as u64);

        {
            let vcpu_slot = state.vcpus.get(processor.index as usize).ok_or(HypervisorError::NotInitialized)?;
            let mut vcpu = vcpu_slot.lock();
            let addresses = ControlAddresses {
                msr_bitmap: platform.host_physical_address(vcpu.msr_bitmap.as_ref() as *const _ as u64),
                io_bitmap_a: platform.host_physical_address(vcpu.io_bitmap.bitmap_a.as_ptr() as u64),
                io_bitmap_b: platform.host_physical_address(vcpu.io_bitmap.bitmap_b.as_ptr() as u64),
                eptp: state.ept.lock().eptp(),
            };
            vmcs::setup_controls(platform, &mut vcpu, &snapshot, &addresses);
            state.resources.apply(platform, &mut vcpu);
        }

        *processor.registers = registers_from_context(&context);
        let host_rsp = processor.host_stack_top();
        let error = launch(&mut processor.registers, host_rsp);

        vmcs::log_entry_failure(platform);
        processor.virtualized.store(false, Ordering::Release);
        leave_vmx_operation()?;
        Err(error)
    }

    fn snapshot(platform: &NativePlatform, context: &CONTEXT) -> ProcessorSnapshot {
        let read_msr = |index: u32| platform.rdmsr(index).unwrap_or(0);

        ProcessorSnapshot {
            cr0: unsafe { x86::controlregs::cr0() }.bits() as u64,
            cr3: unsafe { x86::controlregs::cr3() },
            cr4: unsafe { x86::controlregs::cr4() }.bits() as u64,
            dr7: platform.read_dr(7),
            rsp: context.Rsp,
            rip: context.Rip,
            rflags: u64::from(context.EFlags),
            cs: context.SegCs,
            ss: context.SegSs,
            ds: context.SegDs,
            es: context.SegEs,
            fs: context.SegFs,
            gs: context.SegGs,
            ldtr: unsafe { x86::dtables::ldtr() }.bits(),
            tr: unsafe { x86::task::tr() }.bits(),
            fs_base: read_msr(msr::IA32_FS_BASE),
            gs_base: read_msr(msr::IA32_GS_BASE),
            debugctl: read_msr(msr::IA32_DEBUGCTL),
            sysenter_cs: read_msr(msr::IA32_SYSENTER_CS),
            sysenter_esp: read_msr(msr::IA32_SYSENTER_ESP),
            sysenter_eip: read_msr(msr::IA32_SYSENTER_EIP),
            efer: read_msr(msr::IA32_EFER),
            pat: read_msr(msr::IA32_PAT),
        }
    }

    fn registers_from_context(context: &CONTEXT) -> GuestRegisters {
        let mut registers = GuestRegisters {
            rax: context.Rax,
            rbx: context.Rbx,
            rcx: context.Rcx,
            rdx: context.Rdx,
            rdi: context.Rdi,
            rsi: context.Rsi,
            rbp: context.Rbp,
            r8: context.R8,
            r9: context.R9,
            r10: context.R10,
            r11: context.R11,
            r12: context.R12,
            r13: context.R13,
            r14: context.R14,
            r15: context.R15,
            rip: context.Rip,
            rsp: context.Rsp,
            rflags: u64::from(context.EFlags),
            ..Default::default()
        };

        let base = context as *const CONTEXT as *const u8;
        for (index, xmm) in registers.xmm.iter_mut().enumerate() {
            *xmm = unsafe { core::ptr::read_unaligned(base.add(CONTEXT_XMM0_OFFSET + index * 16) as *const u128) };
        }

        registers
    }
}
