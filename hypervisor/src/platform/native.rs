//! The Windows kernel implementation of [`Platform`].
//!
//! Physical memory is reached through per-processor scratch pages whose PTEs are rewritten for
//! every access, so no mapping API is called from VMX root. Each processor owns two scratch
//! pages: one used in VMX root and one used outside it, because a VM exit can interrupt an access
//! made outside.
//!
//! MSR, PMC and memory probes executed in VMX root are recovered by the host IDT when they fault.

#![allow(non_snake_case)]

use {
    crate::{
        intel::{
            idt::{probe_copy, probe_rdmsr, probe_rdpmc, probe_wrmsr},
            invept::{invept, InveptType},
            vmexit::vmcall::{VmcallCode, VMCALL_SIGNATURE},
        },
        platform::{modules, AccessSize, CpuidResult, LoadedModule, PageAllocation, Platform, ProcessInfo},
    },
    alloc::{vec, vec::Vec},
    core::{
        ffi::c_void,
        mem::MaybeUninit,
        sync::atomic::{AtomicBool, Ordering},
    },
    spin::Once,
    wdk_sys::{
        ntddk::{
            IoGetCurrentProcess, KeGetCurrentProcessorNumberEx, KeGetProcessorNumberFromIndex, KeQueryActiveProcessorCountEx,
            KeRevertToUserGroupAffinityThread, KeSetSystemGroupAffinityThread, KeStallExecutionProcessor, MmAllocateContiguousMemorySpecifyCacheNode,
            MmAllocateMappingAddress, MmFreeContiguousMemory, MmFreeMappingAddress, MmGetPhysicalAddress, MmGetVirtualForPhysical, MmMapIoSpace,
            ObfDereferenceObject, PsGetCurrentProcessId, PsGetCurrentThreadId,
        },
        ALL_PROCESSOR_GROUPS, GROUP_AFFINITY, HANDLE, MM_ANY_NODE_OK, NTSTATUS, NT_SUCCESS, PEPROCESS, PHYSICAL_ADDRESS, PROCESSOR_NUMBER, PULONG, PVOID,
        ULONG,
        _MEMORY_CACHING_TYPE::{MmCached, MmNonCached},
    },
    x86::msr,
};

#[link(name = "ntoskrnl")]
extern "system" {
    fn ZwYieldExecution() -> NTSTATUS;
    fn ZwQuerySystemInformation(SystemInformationClass: ULONG, SystemInformation: PVOID, SystemInformationLength: ULONG, ReturnLength: PULONG) -> NTSTATUS;
    fn PsLookupProcessByProcessId(ProcessId: HANDLE, Process: *mut PEPROCESS) -> NTSTATUS;
    fn PsGetCurrentThread() -> PVOID;
    fn PsGetProcessPeb(Process: PEPROCESS) -> PVOID;
    fn PsGetCurrentThreadTeb() -> PVOID;
    fn PsGetProcessImageFileName(Process: PEPROCESS) -> *const u8;
}

const PAGE_SIZE: u64 = 0x1000;
const PAGE_FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_LARGE: u64 = 1 << 7;
const PTE_NO_EXECUTE: u64 = 1 << 63;
const PTE_ACCESSED_DIRTY: u64 = (1 << 5) | (1 << 6);
const POOL_TAG: u32 = u32::from_le_bytes(*b"hvdg");

/// `KPROCESS.DirectoryTableBase`.
const DIRECTORY_TABLE_BASE_OFFSET: u64 = 0x28;

/// `KUSER_SHARED_DATA.SystemTime`, a `KSYSTEM_TIME`.
const SHARED_SYSTEM_TIME: u64 = 0xFFFF_F780_0000_0014;

const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const X2APIC_ICR: u32 = 0x830;
const XAPIC_ICR_LOW: u64 = 0x300;
const XAPIC_ICR_HIGH: u64 = 0x310;
const ICR_DELIVERY_NMI: u64 = 4 << 8;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;

/// A reserved kernel page whose PTE is pointed at arbitrary physical frames.
#[derive(Debug, Copy, Clone)]
struct ScratchPage {
    va: u64,
    pte: u64,
}

impl ScratchPage {
    fn reserve() -> Option<Self> {
        let va = unsafe { MmAllocateMappingAddress(PAGE_SIZE, POOL_TAG) } as u64;
        if va == 0 {
            return None;
        }

        match pte_address(va) {
            Some(pte) => Some(Self { va, pte }),
            None => {
                unsafe { MmFreeMappingAddress(va as PVOID, POOL_TAG) };
                None
            }
        }
    }

    /// Maps the frame holding `pa` and runs `f` with the virtual address of `pa`.
    fn with_frame<T>(&self, pa: u64, f: impl FnOnce(u64) -> T) -> T {
        let pte = self.pte as *mut u64;
        unsafe {
            pte.write_volatile((pa & PAGE_FRAME_MASK) | PTE_PRESENT | PTE_WRITABLE | PTE_ACCESSED_DIRTY | PTE_NO_EXECUTE);
            x86::tlb::flush(self.va as usize);
        }

        let result = f(self.va + (pa & (PAGE_SIZE - 1)));

        unsafe {
            pte.write_volatile(0);
            x86::tlb::flush(self.va as usize);
        }
        result
    }

    fn release(self) {
        unsafe { MmFreeMappingAddress(self.va as PVOID, POOL_TAG) };
    }
}

/// Finds the PTE of a 4KB system-space mapping by walking the current page tables.
fn pte_address(va: u64) -> Option<u64> {
    let mut table = unsafe { x86::controlregs::cr3() } & PAGE_FRAME_MASK;

    for shift in [39, 30, 21] {
        let table_va = physical_to_virtual(table)?;
        let entry = unsafe { ((table_va + ((va >> shift) & 0x1FF) * 8) as *const u64).read_volatile() };
        if entry & PTE_PRESENT == 0 || (shift != 39 && entry & PTE_LARGE != 0) {
            return None;
        }
        table = entry & PAGE_FRAME_MASK;
    }

    Some(physical_to_virtual(table)? + ((va >> 12) & 0x1FF) * 8)
}

fn physical_to_virtual(pa: u64) -> Option<u64> {
    let mut physical_address: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
    physical_address.QuadPart = pa as i64;
    let va = unsafe { MmGetVirtualForPhysical(physical_address) } as u64;
    (va != 0).then_some(va)
}

/// How NMIs reach other processors.
enum Apic {
    X2Apic,
    /// Virtual address of the memory-mapped local APIC.
    XApic(u64),
}

/// Restores the caller's group affinity when dropped.
struct ProcessorExecutor {
    old_affinity: MaybeUninit<GROUP_AFFINITY>,
}

impl ProcessorExecutor {
    fn switch_to_processor(index: u32) -> Option<Self> {
        let mut processor_number: MaybeUninit<PROCESSOR_NUMBER> = MaybeUninit::uninit();
        if !NT_SUCCESS(unsafe { KeGetProcessorNumberFromIndex(index, processor_number.as_mut_ptr()) }) {
            return None;
        }
        let processor_number = unsafe { processor_number.assume_init() };

        let mut affinity: GROUP_AFFINITY = unsafe { core::mem::zeroed() };
        affinity.Group = processor_number.Group;
        affinity.Mask = 1 << processor_number.Number;

        let mut old_affinity: MaybeUninit<GROUP_AFFINITY> = MaybeUninit::uninit();
        unsafe { KeSetSystemGroupAffinityThread(&mut affinity, old_affinity.as_mut_ptr()) };

        if !NT_SUCCESS(unsafe { ZwYieldExecution() }) {
            unsafe { KeRevertToUserGroupAffinityThread(old_affinity.as_mut_ptr()) };
            return None;
        }

        Some(Self { old_affinity })
    }
}

impl Drop for ProcessorExecutor {
    fn drop(&mut self) {
        unsafe { KeRevertToUserGroupAffinityThread(self.old_affinity.as_mut_ptr()) };
    }
}

/// The running Windows kernel.
pub struct NativePlatform {
    processor_count: u32,
    /// Scratch pages used in VMX root, one per processor.
    root_scratch: Vec<ScratchPage>,
    /// Scratch pages used outside VMX root, one per processor.
    guest_scratch: Vec<ScratchPage>,
    in_root: Vec<AtomicBool>,
    apic: Apic,
    apic_ids: Vec<u32>,
}

static NATIVE_PLATFORM: Once<NativePlatform> = Once::new();

/// The platform, once [`NativePlatform::initialize`] has succeeded.
pub fn platform() -> Option<&'static NativePlatform> {
    NATIVE_PLATFORM.get()
}

impl NativePlatform {
    /// Reserves the scratch pages and discovers the APIC of every processor. Runs at
    /// PASSIVE_LEVEL before any processor is virtualized.
    pub fn initialize() -> Result<&'static Self, crate::error::HypervisorError> {
        NATIVE_PLATFORM.try_call_once(Self::new)
    }

    fn new() -> Result<Self, crate::error::HypervisorError> {
        use crate::error::HypervisorError;

        let processor_count = unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS as _) };

        let mut root_scratch = Vec::new();
        let mut guest_scratch = Vec::new();
        for _ in 0..processor_count {
            let (Some(root), Some(guest)) = (ScratchPage::reserve(), ScratchPage::reserve()) else {
                root_scratch.into_iter().chain(guest_scratch).for_each(ScratchPage::release);
                return Err(HypervisorError::OutOfPool);
            };
            root_scratch.push(root);
            guest_scratch.push(guest);
        }

        let apic_base = unsafe { x86::msr::rdmsr(msr::IA32_APIC_BASE) };
        let apic = if apic_base & APIC_BASE_X2APIC_ENABLE != 0 {
            Apic::X2Apic
        } else {
            let mut physical_address: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
            physical_address.QuadPart = (apic_base & PAGE_FRAME_MASK) as i64;
            let va = unsafe { MmMapIoSpace(physical_address, PAGE_SIZE, MmNonCached) } as u64;
            if va == 0 {
                return Err(HypervisorError::VirtualToPhysicalAddressFailed);
            }
            Apic::XApic(va)
        };

        let mut platform = Self {
            processor_count,
            root_scratch,
            guest_scratch,
            in_root: (0..processor_count).map(|_| AtomicBool::new(false)).collect(),
            apic,
            apic_ids: Vec::new(),
        };

        let mut apic_ids = Vec::new();
        for index in 0..processor_count {
            apic_ids.push(platform.run_on_processor(index, || platform.local_apic_id())?);
        }
        platform.apic_ids = apic_ids;

        log::info!("Native platform ready for {} processors", processor_count);
        Ok(platform)
    }

    /// Runs `f` on processor `index`, restoring the thread's affinity afterwards.
    pub fn run_on_processor<T>(&self, index: u32, f: impl FnOnce() -> T) -> Result<T, crate::error::HypervisorError> {
        let executor = ProcessorExecutor::switch_to_processor(index).ok_or(crate::error::HypervisorError::ProcessorSwitchFailed)?;
        let result = f();
        drop(executor);
        Ok(result)
    }

    /// Marks the current processor as running a VM-exit handler.
    pub fn set_in_root(&self, in_root: bool) {
        if let Some(flag) = self.in_root.get(self.current_core() as usize) {
            flag.store(in_root, Ordering::Release);
        }
    }

    fn is_in_root(&self) -> bool {
        self.in_root.get(self.current_core() as usize).is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn local_apic_id(&self) -> u32 {
        match self.apic {
            Apic::X2Apic => self.cpuid(0xB, 0).edx,
            Apic::XApic(_) => self.cpuid(1, 0).ebx >> 24,
        }
    }

    /// Runs `f` on this processor's scratch page with preemption disabled.
    fn with_scratch<T>(&self, pa: u64, f: impl FnOnce(u64) -> T) -> Option<T> {
        if self.is_in_root() {
            let scratch = self.root_scratch.get(self.current_core() as usize)?;
            return Some(scratch.with_frame(pa, f));
        }

        let previous_irql = self.read_cr(8);
        if previous_irql < 2 {
            self.write_cr(8, 2);
        }
        let result = self.guest_scratch.get(self.current_core() as usize).map(|scratch| scratch.with_frame(pa, f));
        if previous_irql < 2 {
            self.write_cr(8, previous_irql);
        }
        result
    }

    fn copy_physical(&self, pa: u64, len: usize, mut copy: impl FnMut(u64, usize, usize) -> bool) -> bool {
        let mut done = 0;
        while done < len {
            let address = pa + done as u64;
            let chunk = ((PAGE_SIZE - (address & (PAGE_SIZE - 1))) as usize).min(len - done);
            if !self.with_scratch(address, |va| copy(va, done, chunk)).unwrap_or(false) {
                return false;
            }
            done += chunk;
        }
        true
    }

    /// Only the architectural MSR ranges are touched outside VMX root, where a fault would reach
    /// the operating system.
    fn msr_allowed(&self, msr: u32) -> bool {
        self.is_in_root() || msr <= 0x1FFF || (0xC000_0000..=0xC000_1FFF).contains(&msr)
    }

    /// Releases the scratch pages. No processor may be in VMX operation.
    pub fn release(&self) {
        self.root_scratch.iter().chain(self.guest_scratch.iter()).copied().for_each(ScratchPage::release);
    }
}

macro_rules! read_register {
    ($name:literal) => {{
        let value: u64;
        unsafe { core::arch::asm!(concat!("mov {}, ", $name), out(reg) value, options(nomem, nostack)) };
        value
    }};
}

macro_rules! write_register {
    ($name:literal, $value:expr) => {{
        let value: u64 = $value;
        unsafe { core::arch::asm!(concat!("mov ", $name, ", {}"), in(reg) value, options(nomem, nostack)) };
    }};
}

impl Platform for NativePlatform {
    fn vmread(&self, field: u32) -> u64 {
        crate::intel::support::vmread(field)
    }

    fn vmwrite(&self, field: u32, value: u64) {
        crate::intel::support::vmwrite(field, value)
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) };
        CpuidResult { eax: result.eax, ebx: result.ebx, ecx: result.ecx, edx: result.edx }
    }

    fn rdmsr(&self, msr: u32) -> Option<u64> {
        if !self.msr_allowed(msr) {
            return None;
        }
        let mut value = 0;
        (unsafe { probe_rdmsr(msr, &mut value) } == 0).then_some(value)
    }

    fn wrmsr(&self, msr: u32, value: u64) -> bool {
        self.msr_allowed(msr) && unsafe { probe_wrmsr(msr, value) } == 0
    }

    fn rdtsc(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn rdtscp(&self) -> (u64, u32) {
        let mut aux = 0;
        let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn rdpmc(&self, counter: u32) -> Option<u64> {
        if !self.is_in_root() {
            return None;
        }
        let mut value = 0;
        (unsafe { probe_rdpmc(counter, &mut value) } == 0).then_some(value)
    }

    fn port_read(&self, port: u16, size: AccessSize) -> u32 {
        unsafe {
            match size {
                AccessSize::Byte => u32::from(x86::io::inb(port)),
                AccessSize::Word => u32::from(x86::io::inw(port)),
                AccessSize::Dword => x86::io::inl(port),
            }
        }
    }

    fn port_write(&self, port: u16, size: AccessSize, value: u32) {
        unsafe {
            match size {
                AccessSize::Byte => x86::io::outb(port, value as u8),
                AccessSize::Word => x86::io::outw(port, value as u16),
                AccessSize::Dword => x86::io::outl(port, value),
            }
        }
    }

    fn xsetbv(&self, xcr: u32, value: u64) {
        unsafe { core::arch::asm!("xsetbv", in("ecx") xcr, in("eax") value as u32, in("edx") (value >> 32) as u32, options(nostack)) };
    }

    fn read_dr(&self, index: u8) -> u64 {
        match index {
            0 => read_register!("dr0"),
            1 => read_register!("dr1"),
            2 => read_register!("dr2"),
            3 => read_register!("dr3"),
            6 => read_register!("dr6"),
            7 => read_register!("dr7"),
            _ => 0,
        }
    }

    fn write_dr(&self, index: u8, value: u64) {
        match index {
            0 => write_register!("dr0", value),
            1 => write_register!("dr1", value),
            2 => write_register!("dr2", value),
            3 => write_register!("dr3", value),
            6 => write_register!("dr6", value),
            7 => write_register!("dr7", value),
            _ => {}
        }
    }

    fn read_cr(&self, index: u8) -> u64 {
        match index {
            2 => read_register!("cr2"),
            3 => read_register!("cr3"),
            8 => read_register!("cr8"),
            _ => 0,
        }
    }

    fn write_cr(&self, index: u8, value: u64) {
        match index {
            2 => write_register!("cr2", value),
            8 => write_register!("cr8", value),
            _ => log::warn!("Refusing to write CR{} directly", index),
        }
    }

    fn read_physical(&self, pa: u64, buffer: &mut [u8]) -> bool {
        let destination = buffer.as_mut_ptr();
        self.copy_physical(pa, buffer.len(), |va, offset, len| unsafe { probe_copy(destination.add(offset), va as *const u8, len) } == 0)
    }

    fn write_physical(&self, pa: u64, buffer: &[u8]) -> bool {
        let source = buffer.as_ptr();
        self.copy_physical(pa, buffer.len(), |va, offset, len| unsafe { probe_copy(va as *mut u8, source.add(offset), len) } == 0)
    }

    fn invept(&self, invept_type: InveptType, eptp: u64) {
        if self.is_in_root() {
            return invept(invept_type, eptp);
        }

        // INVEPT exits from VMX non-root; the handler executes it on this processor.
        let code = match invept_type {
            InveptType::SingleContext => VmcallCode::InveptSingleContext,
            InveptType::AllContexts => VmcallCode::InveptAllContexts,
        };
        self.vmcall(code as u64, [eptp, 0, 0]);
    }

    fn invlpg(&self, va: u64) {
        unsafe { x86::tlb::flush(va as usize) };
    }

    fn host_physical_address(&self, va: u64) -> u64 {
        unsafe { MmGetPhysicalAddress(va as PVOID).QuadPart as u64 }
    }

    fn physical_to_virtual(&self, pa: u64) -> Option<u64> {
        physical_to_virtual(pa)
    }

    fn process_directory_base(&self, pid: u32) -> Option<u64> {
        let mut process: PEPROCESS = core::ptr::null_mut();
        if !NT_SUCCESS(unsafe { PsLookupProcessByProcessId(pid as usize as HANDLE, &mut process) }) {
            return None;
        }

        let directory_base = unsafe { ((process as u64 + DIRECTORY_TABLE_BASE_OFFSET) as *const u64).read_volatile() };
        unsafe { ObfDereferenceObject(process as PVOID) };
        Some(directory_base)
    }

    fn wbinvd(&self) {
        unsafe { core::arch::asm!("wbinvd", options(nostack)) };
    }

    fn allocate_pages(&self, count: usize) -> Option<PageAllocation> {
        let mut lowest: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        let mut highest: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        let mut boundary: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        lowest.QuadPart = 0;
        highest.QuadPart = -1;
        boundary.QuadPart = 0;

        let size = count as u64 * PAGE_SIZE;
        let memory = unsafe { MmAllocateContiguousMemorySpecifyCacheNode(size, lowest, highest, boundary, MmCached, MM_ANY_NODE_OK) } as *mut u8;
        if memory.is_null() {
            return None;
        }

        unsafe { core::ptr::write_bytes(memory, 0, size as usize) };
        Some(PageAllocation { va: memory as u64, pa: self.host_physical_address(memory as u64) })
    }

    fn free_pages(&self, allocation: PageAllocation, _count: usize) {
        unsafe { MmFreeContiguousMemory(allocation.va as PVOID) };
    }

    fn current_core(&self) -> u32 {
        unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
    }

    fn processor_count(&self) -> u32 {
        self.processor_count
    }

    fn process_info(&self) -> ProcessInfo {
        let process = unsafe { IoGetCurrentProcess() };
        let mut name = [0u8; 16];

        let image_name = unsafe { PsGetProcessImageFileName(process) };
        if !image_name.is_null() {
            let image_name = unsafe { core::slice::from_raw_parts(image_name, 15) };
            name[..15].copy_from_slice(image_name);
        }

        ProcessInfo {
            pid: unsafe { PsGetCurrentProcessId() } as usize as u32,
            tid: unsafe { PsGetCurrentThreadId() } as usize as u32,
            process: process as u64,
            thread: unsafe { PsGetCurrentThread() } as u64,
            peb: unsafe { PsGetProcessPeb(process) } as u64,
            teb: unsafe { PsGetCurrentThreadTeb() } as u64,
            name,
        }
    }

    fn loaded_modules(&self) -> Vec<LoadedModule> {
        let mut bytes: ULONG = 0;
        unsafe { ZwQuerySystemInformation(modules::SYSTEM_MODULE_INFORMATION, core::ptr::null_mut(), 0, &mut bytes) };
        if bytes == 0 {
            return Vec::new();
        }

        // The list can grow between the two calls.
        let mut buffer = vec![0u8; bytes as usize + 0x1000];
        let status = unsafe { ZwQuerySystemInformation(modules::SYSTEM_MODULE_INFORMATION, buffer.as_mut_ptr() as *mut c_void, buffer.len() as ULONG, &mut bytes) };
        if !NT_SUCCESS(status) {
            log::warn!("Querying the module list failed: {:#x}", status);
            return Vec::new();
        }

        modules::parse_module_list(&buffer)
    }

    fn vmcall(&self, code: u64, params: [u64; 3]) -> u64 {
        let status: u64;
        unsafe {
            core::arch::asm!(
                "vmcall",
                inout("rcx") code => _,
                inout("rdx") params[0] => _,
                inout("r8") params[1] => _,
                inout("r9") params[2] => _,
                inout("r10") VMCALL_SIGNATURE => _,
                out("rax") status,
                out("r11") _,
            )
        };
        status
    }

    fn send_nmi(&self, core: u32) {
        let Some(&apic_id) = self.apic_ids.get(core as usize) else {
            return;
        };

        match self.apic {
            Apic::X2Apic => {
                self.wrmsr(X2APIC_ICR, (u64::from(apic_id) << 32) | ICR_DELIVERY_NMI | ICR_LEVEL_ASSERT);
            }
            Apic::XApic(base) => unsafe {
                ((base + XAPIC_ICR_HIGH) as *mut u32).write_volatile(apic_id << 24);
                ((base + XAPIC_ICR_LOW) as *mut u32).write_volatile((ICR_DELIVERY_NMI | ICR_LEVEL_ASSERT) as u32);
            },
        }
    }

    fn system_time(&self) -> u64 {
        let low = SHARED_SYSTEM_TIME as *const u32;
        let high1 = (SHARED_SYSTEM_TIME + 4) as *const u32;
        let high2 = (SHARED_SYSTEM_TIME + 8) as *const u32;

        loop {
            let (high, low, check) = unsafe { (high1.read_volatile(), low.read_volatile(), high2.read_volatile()) };
            if high == check {
                return (u64::from(high) << 32) | u64::from(low);
            }
        }
    }

    fn microsleep(&self, microseconds: u64) {
        unsafe { KeStallExecutionProcessor(microseconds as ULONG) };
    }
}
