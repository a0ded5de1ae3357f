//! An in-memory [`Platform`] used to drive the engine on a development host.
//!
//! Physical memory is a sparse map of 4KB frames, the VMCS is a map of field encodings and every
//! other piece of hardware state is a plain value that tests can seed and inspect.

use {
    super::{AccessSize, CpuidResult, LoadedModule, PageAllocation, Platform, ProcessInfo},
    crate::intel::invept::InveptType,
    alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec},
    spin::Mutex,
};

const PAGE_SIZE: u64 = 0x1000;

/// Virtual base the mock kernel maps its allocations at.
pub const KERNEL_VA_BASE: u64 = 0xFFFF_A000_0000_0000;

/// First physical frame handed out by `allocate_pages`.
const ALLOCATION_BASE: u64 = 0x1_0000_0000;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

struct MockState {
    vmcs: BTreeMap<u32, u64>,
    frames: BTreeMap<u64, Box<[u8]>>,
    msrs: BTreeMap<u32, u64>,
    cpuid: BTreeMap<(u32, u32), CpuidResult>,
    ports: BTreeMap<u16, u32>,
    port_writes: Vec<(u16, AccessSize, u32)>,
    xcr_writes: Vec<(u32, u64)>,
    debug_registers: [u64; 8],
    cr2: u64,
    cr3: u64,
    cr8: u64,
    tsc: u64,
    tsc_step: u64,
    tsc_aux: u32,
    pmc: BTreeMap<u32, u64>,
    invept_count: usize,
    invlpg_count: usize,
    next_allocation: u64,
    allocation_limit: Option<usize>,
    current_core: u32,
    processor_count: u32,
    process: ProcessInfo,
    nmis: Vec<u32>,
    system_time: u64,
    slept: u64,
    directory_bases: BTreeMap<u32, u64>,
    cache_flushes: usize,
    modules: Vec<LoadedModule>,
    vmcalls: Vec<(u64, [u64; 3])>,
}

/// In-memory hardware model.
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new(processor_count: u32) -> Self {
        Self {
            state: Mutex::new(MockState {
                vmcs: BTreeMap::new(),
                frames: BTreeMap::new(),
                msrs: BTreeMap::new(),
                cpuid: BTreeMap::new(),
                ports: BTreeMap::new(),
                port_writes: Vec::new(),
                xcr_writes: Vec::new(),
                debug_registers: [0; 8],
                cr2: 0,
                cr3: 0,
                cr8: 0,
                tsc: 0x1000_0000,
                tsc_step: 100,
                tsc_aux: 0,
                pmc: BTreeMap::new(),
                invept_count: 0,
                invlpg_count: 0,
                next_allocation: ALLOCATION_BASE,
                allocation_limit: None,
                current_core: 0,
                processor_count,
                process: ProcessInfo { pid: 4, tid: 8, ..Default::default() },
                nmis: Vec::new(),
                system_time: 133_000_000_000_000_000,
                slept: 0,
                directory_bases: BTreeMap::new(),
                cache_flushes: 0,
                modules: Vec::new(),
                vmcalls: Vec::new(),
            }),
        }
    }

    pub fn set_vmcs(&self, field: u32, value: u64) {
        self.state.lock().vmcs.insert(field, value);
    }

    pub fn vmcs(&self, field: u32) -> u64 {
        self.state.lock().vmcs.get(&field).copied().unwrap_or(0)
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.state.lock().msrs.insert(msr, value);
    }

    pub fn msr(&self, msr: u32) -> Option<u64> {
        self.state.lock().msrs.get(&msr).copied()
    }

    pub fn set_cpuid(&self, leaf: u32, sub_leaf: u32, result: CpuidResult) {
        self.state.lock().cpuid.insert((leaf, sub_leaf), result);
    }

    pub fn set_port(&self, port: u16, value: u32) {
        self.state.lock().ports.insert(port, value);
    }

    pub fn port_writes(&self) -> Vec<(u16, AccessSize, u32)> {
        self.state.lock().port_writes.clone()
    }

    pub fn xcr_writes(&self) -> Vec<(u32, u64)> {
        self.state.lock().xcr_writes.clone()
    }

    pub fn set_pmc(&self, counter: u32, value: u64) {
        self.state.lock().pmc.insert(counter, value);
    }

    pub fn set_tsc(&self, tsc: u64) {
        self.state.lock().tsc = tsc;
    }

    /// Sets the amount the time-stamp counter advances on every read.
    pub fn set_tsc_step(&self, step: u64) {
        self.state.lock().tsc_step = step;
    }

    pub fn set_current_core(&self, core: u32) {
        self.state.lock().current_core = core;
    }

    pub fn set_process(&self, process: ProcessInfo) {
        self.state.lock().process = process;
    }

    pub fn nmis_sent(&self) -> Vec<u32> {
        self.state.lock().nmis.clone()
    }

    pub fn invept_count(&self) -> usize {
        self.state.lock().invept_count
    }

    /// Registers the address space of `pid` for `process_directory_base`.
    pub fn set_directory_base(&self, pid: u32, cr3: u64) {
        self.state.lock().directory_bases.insert(pid, cr3);
    }

    pub fn microseconds_slept(&self) -> u64 {
        self.state.lock().slept
    }

    pub fn cache_flushes(&self) -> usize {
        self.state.lock().cache_flushes
    }

    pub fn set_system_time(&self, time: u64) {
        self.state.lock().system_time = time;
    }

    pub fn debug_register(&self, index: u8) -> u64 {
        self.state.lock().debug_registers[usize::from(index & 7)]
    }

    /// Every `vmcall` issued so far.
    pub fn vmcalls(&self) -> Vec<(u64, [u64; 3])> {
        self.state.lock().vmcalls.clone()
    }

    pub fn load_module(&self, path: &[u8], base: u64, size: u32) {
        self.state.lock().modules.push(LoadedModule { base, size, path: path.to_vec() });
    }

    /// Makes `allocate_pages` fail after `pages` more pages have been handed out.
    pub fn limit_allocations(&self, pages: usize) {
        self.state.lock().allocation_limit = Some(pages);
    }

    /// Writes `bytes` at `pa`, creating frames as needed.
    pub fn write_memory(&self, pa: u64, bytes: &[u8]) {
        let mut state = self.state.lock();
        for (offset, byte) in bytes.iter().enumerate() {
            let address = pa + offset as u64;
            let frame = state
                .frames
                .entry(address & !(PAGE_SIZE - 1))
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            frame[(address & (PAGE_SIZE - 1)) as usize] = *byte;
        }
    }

    /// Reads `len` bytes at `pa`. Missing frames read as zero.
    pub fn read_memory(&self, pa: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        (0..len as u64)
            .map(|offset| {
                let address = pa + offset;
                state
                    .frames
                    .get(&(address & !(PAGE_SIZE - 1)))
                    .map(|frame| frame[(address & (PAGE_SIZE - 1)) as usize])
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Creates an empty PML4 and returns its physical address, usable as a CR3 value.
    pub fn create_address_space(&self) -> u64 {
        self.allocate_frame()
    }

    /// Maps the 4KB page at `va` to `pa` in the address space rooted at `cr3`.
    pub fn map_page(&self, cr3: u64, va: u64, pa: u64, writable: bool) {
        let mut table = cr3 & PTE_ADDRESS_MASK;
        let flags = PTE_PRESENT | PTE_USER | if writable { PTE_WRITABLE } else { 0 };

        for shift in [39u64, 30, 21] {
            let entry_pa = table + ((va >> shift) & 0x1FF) * 8;
            let entry = self.read_u64(entry_pa);

            table = if entry & PTE_PRESENT != 0 {
                entry & PTE_ADDRESS_MASK
            } else {
                let next = self.allocate_frame();
                self.write_memory(entry_pa, &(next | PTE_PRESENT | PTE_WRITABLE | PTE_USER).to_le_bytes());
                next
            };
        }

        let pte_pa = table + ((va >> 12) & 0x1FF) * 8;
        self.write_memory(pte_pa, &((pa & PTE_ADDRESS_MASK) | flags).to_le_bytes());
    }

    /// Backs `[va, va + len)` with fresh frames in `cr3` and copies `bytes` there.
    pub fn map_bytes(&self, cr3: u64, va: u64, bytes: &[u8]) -> Vec<u64> {
        let first = va & !(PAGE_SIZE - 1);
        let last = (va + bytes.len().max(1) as u64 - 1) & !(PAGE_SIZE - 1);
        let mut frames = Vec::new();

        let mut page = first;
        while page <= last {
            let frame = self.allocate_frame();
            self.map_page(cr3, page, frame, true);
            frames.push(frame);
            page += PAGE_SIZE;
        }

        for (offset, byte) in bytes.iter().enumerate() {
            let address = va + offset as u64;
            let frame = frames[((address & !(PAGE_SIZE - 1)) - first) as usize / PAGE_SIZE as usize];
            self.write_memory(frame + (address & (PAGE_SIZE - 1)), &[*byte]);
        }

        frames
    }

    fn read_u64(&self, pa: u64) -> u64 {
        let bytes = self.read_memory(pa, 8);
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes);
        u64::from_le_bytes(value)
    }

    fn allocate_frame(&self) -> u64 {
        let mut state = self.state.lock();
        let pa = state.next_allocation;
        state.next_allocation += PAGE_SIZE;
        state.frames.insert(pa, vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        pa
    }
}

impl Platform for MockPlatform {
    fn vmread(&self, field: u32) -> u64 {
        self.vmcs(field)
    }

    fn vmwrite(&self, field: u32, value: u64) {
        self.set_vmcs(field, value);
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        let state = self.state.lock();
        state
            .cpuid
            .get(&(leaf, sub_leaf))
            .or_else(|| state.cpuid.get(&(leaf, 0)))
            .copied()
            .unwrap_or_default()
    }

    fn rdmsr(&self, msr: u32) -> Option<u64> {
        self.msr(msr)
    }

    fn wrmsr(&self, msr: u32, value: u64) -> bool {
        let mut state = self.state.lock();
        match state.msrs.get_mut(&msr) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn rdtsc(&self) -> u64 {
        let mut state = self.state.lock();
        state.tsc += state.tsc_step;
        state.tsc
    }

    fn rdtscp(&self) -> (u64, u32) {
        let tsc = self.rdtsc();
        (tsc, self.state.lock().tsc_aux)
    }

    fn rdpmc(&self, counter: u32) -> Option<u64> {
        self.state.lock().pmc.get(&counter).copied()
    }

    fn port_read(&self, port: u16, size: AccessSize) -> u32 {
        let value = self.state.lock().ports.get(&port).copied().unwrap_or(0xFFFF_FFFF);
        (u64::from(value) & size.mask()) as u32
    }

    fn port_write(&self, port: u16, size: AccessSize, value: u32) {
        let mut state = self.state.lock();
        state.port_writes.push((port, size, value));
        state.ports.insert(port, value);
    }

    fn xsetbv(&self, xcr: u32, value: u64) {
        self.state.lock().xcr_writes.push((xcr, value));
    }

    fn read_dr(&self, index: u8) -> u64 {
        self.debug_register(index)
    }

    fn write_dr(&self, index: u8, value: u64) {
        self.state.lock().debug_registers[usize::from(index & 7)] = value;
    }

    fn read_cr(&self, index: u8) -> u64 {
        let state = self.state.lock();
        match index {
            2 => state.cr2,
            3 => state.cr3,
            8 => state.cr8,
            _ => 0,
        }
    }

    fn write_cr(&self, index: u8, value: u64) {
        let mut state = self.state.lock();
        match index {
            2 => state.cr2 = value,
            3 => state.cr3 = value,
            8 => state.cr8 = value,
            _ => {}
        }
    }

    fn read_physical(&self, pa: u64, buffer: &mut [u8]) -> bool {
        let state = self.state.lock();
        let mut address = pa;
        let mut copied = 0;
        let mut staged = vec![0u8; buffer.len()];

        while copied < buffer.len() {
            let Some(frame) = state.frames.get(&(address & !(PAGE_SIZE - 1))) else {
                return false;
            };
            let offset = (address & (PAGE_SIZE - 1)) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(buffer.len() - copied);
            staged[copied..copied + chunk].copy_from_slice(&frame[offset..offset + chunk]);
            copied += chunk;
            address += chunk as u64;
        }

        buffer.copy_from_slice(&staged);
        true
    }

    fn write_physical(&self, pa: u64, buffer: &[u8]) -> bool {
        {
            let state = self.state.lock();
            let first = pa & !(PAGE_SIZE - 1);
            let last = (pa + buffer.len().max(1) as u64 - 1) & !(PAGE_SIZE - 1);
            let mut page = first;
            while page <= last {
                if !state.frames.contains_key(&page) {
                    return false;
                }
                page += PAGE_SIZE;
            }
        }
        self.write_memory(pa, buffer);
        true
    }

    fn invept(&self, _invept_type: InveptType, _eptp: u64) {
        self.state.lock().invept_count += 1;
    }

    fn invlpg(&self, _va: u64) {
        self.state.lock().invlpg_count += 1;
    }

    fn host_physical_address(&self, va: u64) -> u64 {
        if va >= KERNEL_VA_BASE {
            va - KERNEL_VA_BASE
        } else {
            va
        }
    }

    fn physical_to_virtual(&self, pa: u64) -> Option<u64> {
        self.state
            .lock()
            .frames
            .contains_key(&(pa & !(PAGE_SIZE - 1)))
            .then_some(KERNEL_VA_BASE + pa)
    }

    fn process_directory_base(&self, pid: u32) -> Option<u64> {
        self.state.lock().directory_bases.get(&pid).copied()
    }

    fn wbinvd(&self) {
        self.state.lock().cache_flushes += 1;
    }

    fn allocate_pages(&self, count: usize) -> Option<PageAllocation> {
        {
            let mut state = self.state.lock();
            if let Some(limit) = state.allocation_limit.as_mut() {
                if *limit < count {
                    return None;
                }
                *limit -= count;
            }
        }

        let pa = self.allocate_frame();
        for _ in 1..count {
            self.allocate_frame();
        }

        Some(PageAllocation { va: KERNEL_VA_BASE + pa, pa })
    }

    fn free_pages(&self, allocation: PageAllocation, count: usize) {
        let mut state = self.state.lock();
        for index in 0..count as u64 {
            state.frames.remove(&(allocation.pa + index * PAGE_SIZE));
        }
    }

    fn current_core(&self) -> u32 {
        self.state.lock().current_core
    }

    fn processor_count(&self) -> u32 {
        self.state.lock().processor_count
    }

    fn process_info(&self) -> ProcessInfo {
        self.state.lock().process
    }

    fn send_nmi(&self, core: u32) {
        self.state.lock().nmis.push(core);
    }

    fn system_time(&self) -> u64 {
        self.state.lock().system_time
    }

    fn microsleep(&self, microseconds: u64) {
        self.state.lock().slept += microseconds;
    }

    fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.state.lock().modules.clone()
    }

    fn vmcall(&self, code: u64, params: [u64; 3]) -> u64 {
        self.state.lock().vmcalls.push((code, params));
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_mapping_round_trip() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        let frames = platform.map_bytes(cr3, 0x7FF0_0FFE, &[1, 2, 3, 4]);

        assert_eq!(frames.len(), 2);
        assert_eq!(platform.read_memory(frames[0] + 0xFFE, 2), vec![1, 2]);
        assert_eq!(platform.read_memory(frames[1], 2), vec![3, 4]);
    }

    #[test]
    fn test_read_physical_of_missing_frame_fails() {
        let platform = MockPlatform::new(1);
        let mut buffer = [0xAAu8; 4];

        assert!(!platform.read_physical(0xDEAD_0000, &mut buffer));
        assert_eq!(buffer, [0xAA; 4]);
    }

    #[test]
    fn test_allocation_limit() {
        let platform = MockPlatform::new(1);
        platform.limit_allocations(1);

        assert!(platform.allocate_pages(1).is_some());
        assert!(platform.allocate_pages(1).is_none());
    }
}
