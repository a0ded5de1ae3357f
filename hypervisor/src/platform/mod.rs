//! The hardware seam of the engine.
//!
//! Every privileged operation the VM-exit handlers, the event engine and the debugger need is
//! expressed through [`Platform`]. The native implementation executes the real instructions from
//! VMX root; the in-memory implementation in [`mock`] lets the whole engine run on a development
//! host.

use {crate::intel::invept::InveptType, alloc::vec::Vec};

pub mod mock;
pub mod modules;

#[cfg(windows)]
pub mod native;

/// Register values returned by `CPUID`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Operand size of an I/O port access.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl AccessSize {
    /// Decodes the size field of an I/O exit qualification (0, 1 or 3).
    pub fn from_qualification(value: u64) -> Option<Self> {
        match value {
            0 => Some(AccessSize::Byte),
            1 => Some(AccessSize::Word),
            3 => Some(AccessSize::Dword),
            _ => None,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Byte => 0xFF,
            AccessSize::Word => 0xFFFF,
            AccessSize::Dword => 0xFFFF_FFFF,
        }
    }
}

/// The process and thread the guest was running when the exit happened.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub tid: u32,
    /// Address of the executive process object.
    pub process: u64,
    /// Address of the executive thread object.
    pub thread: u64,
    pub peb: u64,
    pub teb: u64,
    /// Image file name, NUL padded.
    pub name: [u8; 16],
}

impl ProcessInfo {
    /// Image name truncated at the first NUL.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }
}

/// A loaded kernel image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub base: u64,
    pub size: u32,
    /// Full image path, for example `\SystemRoot\system32\ntoskrnl.exe`.
    pub path: Vec<u8>,
}

/// A physically contiguous allocation usable from VMX root.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageAllocation {
    /// Kernel virtual address valid in every address space.
    pub va: u64,
    pub pa: u64,
}

/// Privileged operations required by the engine.
///
/// Methods take `&self` because they are invoked concurrently from every logical processor; an
/// implementation keeps any state it needs behind its own synchronisation.
pub trait Platform: Sync {
    /// Reads a field of the current VMCS. Unsupported fields read as zero.
    fn vmread(&self, field: u32) -> u64;

    /// Writes a field of the current VMCS.
    fn vmwrite(&self, field: u32, value: u64);

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult;

    /// Reads an MSR, returning `None` when the read raises #GP.
    fn rdmsr(&self, msr: u32) -> Option<u64>;

    /// Writes an MSR, returning `false` when the write raises #GP.
    fn wrmsr(&self, msr: u32, value: u64) -> bool;

    fn rdtsc(&self) -> u64;

    /// Returns the time-stamp counter and `IA32_TSC_AUX`.
    fn rdtscp(&self) -> (u64, u32);

    fn rdpmc(&self, counter: u32) -> Option<u64>;

    fn port_read(&self, port: u16, size: AccessSize) -> u32;

    fn port_write(&self, port: u16, size: AccessSize, value: u32);

    fn xsetbv(&self, xcr: u32, value: u64);

    /// Reads a debug register (0..=7) of the current processor.
    fn read_dr(&self, index: u8) -> u64;

    fn write_dr(&self, index: u8, value: u64);

    /// Reads CR2 or CR8, the control registers that do not live in the VMCS.
    fn read_cr(&self, index: u8) -> u64;

    fn write_cr(&self, index: u8, value: u64);

    /// Copies physical memory into `buffer`. Returns `false` without touching `buffer` when the
    /// range is not backed by RAM.
    fn read_physical(&self, pa: u64, buffer: &mut [u8]) -> bool;

    /// Copies `buffer` into physical memory.
    fn write_physical(&self, pa: u64, buffer: &[u8]) -> bool;

    fn invept(&self, invept_type: InveptType, eptp: u64);

    fn invlpg(&self, va: u64);

    /// Translates a host virtual address to its physical address.
    fn host_physical_address(&self, va: u64) -> u64;

    /// Kernel virtual address that maps `pa`, if the physical range is mapped in system space.
    fn physical_to_virtual(&self, pa: u64) -> Option<u64>;

    /// Directory table base (CR3) of the process `pid`, if it exists.
    fn process_directory_base(&self, pid: u32) -> Option<u64>;

    /// Writes back and invalidates the caches.
    fn wbinvd(&self);

    /// Allocates `count` zeroed, physically contiguous pages. Only valid outside VMX root.
    fn allocate_pages(&self, count: usize) -> Option<PageAllocation>;

    fn free_pages(&self, allocation: PageAllocation, count: usize);

    fn current_core(&self) -> u32;

    fn processor_count(&self) -> u32;

    fn process_info(&self) -> ProcessInfo;

    /// Kernel images currently loaded. Only valid outside VMX root.
    fn loaded_modules(&self) -> Vec<LoadedModule>;

    /// Issues a signed `vmcall` with `code` in RCX and `params` in RDX, R8 and R9. Returns RAX.
    /// Only valid outside VMX root.
    fn vmcall(&self, code: u64, params: [u64; 3]) -> u64;

    /// Sends an NMI to `core` so that it exits to VMX root.
    fn send_nmi(&self, core: u32);

    /// System time in 100ns units since 1601-01-01.
    fn system_time(&self) -> u64;

    fn microsleep(&self, microseconds: u64);
}
