//! Reads and writes guest virtual memory from VMX root.
//!
//! Translation walks the guest's own 4-level paging structures through physical reads; the
//! platform performs the physical access through its per-processor scratch mapping. Nothing here
//! changes guest paging state, and every access is validated before the first byte is copied.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 4.5 4-LEVEL PAGING AND 5-LEVEL PAGING

use {
    crate::{error::HypervisorError, platform::Platform},
    alloc::{vec, vec::Vec},
    bitfield::bitfield,
    x86::vmx::vmcs::guest,
};

pub const PAGE_SIZE: u64 = 0x1000;

/// Physical address bits of a CR3 value, without PCID and flags.
pub const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitfield! {
    /// An entry of any level of the guest's paging structures.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 4-15 through Table 4-20
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct PageEntry(u64);
    impl Debug;

    pub present, _: 0;
    pub writable, _: 1;
    pub user, _: 2;
    pub accessed, _: 5;
    pub dirty, _: 6;
    pub large, _: 7;
    pub pfn, _: 51, 12;
    pub no_execute, _: 63;
}

impl PageEntry {
    pub fn address(&self) -> u64 {
        self.pfn() << 12
    }
}

/// Result of a successful page walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    pub pa: u64,
    /// Size of the page that maps the address (4KB, 2MB or 1GB).
    pub page_size: u64,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

/// One level of a page walk: where the entry lives and what it holds.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    /// Physical address of the entry.
    pub address: u64,
    pub value: u64,
}

/// Every paging-structure entry that takes part in translating one address. Levels below a
/// missing or large entry are `None`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PteQuery {
    pub va: u64,
    pub pml4e: Option<EntryLocation>,
    pub pdpte: Option<EntryLocation>,
    pub pde: Option<EntryLocation>,
    pub pte: Option<EntryLocation>,
}

/// The CR3 of the address space the guest was running when the exit happened.
pub fn guest_cr3(platform: &dyn Platform) -> u64 {
    platform.vmread(guest::CR3) & CR3_ADDRESS_MASK
}

/// Resolves the address space of `pid`, or the current one for `None`.
pub fn cr3_of(platform: &dyn Platform, pid: Option<u32>) -> Result<u64, HypervisorError> {
    match pid {
        None => Ok(guest_cr3(platform)),
        Some(pid) => platform
            .process_directory_base(pid)
            .map(|cr3| cr3 & CR3_ADDRESS_MASK)
            .ok_or(HypervisorError::MemoryAccessFaulted),
    }
}

fn is_canonical(va: u64) -> bool {
    let upper = va >> 47;
    upper == 0 || upper == 0x1_FFFF
}

fn read_entry(platform: &dyn Platform, address: u64) -> Option<PageEntry> {
    let mut raw = [0u8; 8];
    platform.read_physical(address, &mut raw).then(|| PageEntry(u64::from_le_bytes(raw)))
}

/// Lists the paging-structure entries used to translate `va` in the address space `cr3`.
pub fn query_pte(platform: &dyn Platform, cr3: u64, va: u64) -> PteQuery {
    let mut query = PteQuery { va, ..Default::default() };
    if !is_canonical(va) {
        return query;
    }

    let mut table = cr3 & CR3_ADDRESS_MASK;
    for (level, shift) in [39u64, 30, 21, 12].into_iter().enumerate() {
        let address = table + ((va >> shift) & 0x1FF) * 8;
        let Some(entry) = read_entry(platform, address) else {
            break;
        };

        let location = Some(EntryLocation { address, value: entry.0 });
        match level {
            0 => query.pml4e = location,
            1 => query.pdpte = location,
            2 => query.pde = location,
            _ => query.pte = location,
        }

        if !entry.present() || (level == 1 || level == 2) && entry.large() {
            break;
        }
        table = entry.address();
    }

    query
}

/// Walks the paging structures of `cr3` for `va`.
///
/// Fails with `MemoryAccessFaulted` when any level is missing or not present.
pub fn translate(platform: &dyn Platform, cr3: u64, va: u64) -> Result<Translation, HypervisorError> {
    if !is_canonical(va) {
        return Err(HypervisorError::MemoryAccessFaulted);
    }

    let mut table = cr3 & CR3_ADDRESS_MASK;
    let mut writable = true;
    let mut user = true;
    let mut executable = true;

    for shift in [39u64, 30, 21, 12] {
        let entry = read_entry(platform, table + ((va >> shift) & 0x1FF) * 8)
            .filter(PageEntry::present)
            .ok_or(HypervisorError::MemoryAccessFaulted)?;

        writable &= entry.writable();
        user &= entry.user();
        executable &= !entry.no_execute();

        if shift == 12 || (shift != 39 && entry.large()) {
            let page_size = 1u64 << shift;
            let base = entry.address() & !(page_size - 1);
            return Ok(Translation { pa: base | (va & (page_size - 1)), page_size, writable, user, executable });
        }

        table = entry.address();
    }

    Err(HypervisorError::MemoryAccessFaulted)
}

pub fn virtual_to_physical(platform: &dyn Platform, cr3: u64, va: u64) -> Result<u64, HypervisorError> {
    translate(platform, cr3, va)
        .map(|translation| translation.pa)
        .map_err(|_| HypervisorError::VirtualToPhysicalAddressFailed)
}

pub fn physical_to_virtual(platform: &dyn Platform, pa: u64) -> Result<u64, HypervisorError> {
    platform.physical_to_virtual(pa).ok_or(HypervisorError::MemoryAccessFaulted)
}

/// Calls `f` with `(va, len)` for each page-bounded chunk of `[va, va + size)`.
fn for_each_chunk(va: u64, size: usize, mut f: impl FnMut(u64, usize) -> Result<(), HypervisorError>) -> Result<(), HypervisorError> {
    let mut address = va;
    let mut remaining = size;

    while remaining > 0 {
        let in_page = (PAGE_SIZE - (address & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(remaining);
        f(address, chunk)?;
        address = address.checked_add(chunk as u64).ok_or(HypervisorError::MemoryAccessFaulted)?;
        remaining -= chunk;
    }

    Ok(())
}

/// Whether every byte of `[va, va + size)` is mapped and present in `cr3`.
///
/// A true result means a following read of the same range will not fault.
pub fn check_access(platform: &dyn Platform, cr3: u64, va: u64, size: usize) -> bool {
    if size == 0 {
        return false;
    }
    for_each_chunk(va, size, |address, _| translate(platform, cr3, address).map(|_| ())).is_ok()
}

/// Whether the instruction bytes at `va` may be fetched.
pub fn is_executable(platform: &dyn Platform, cr3: u64, va: u64) -> bool {
    translate(platform, cr3, va).is_ok_and(|translation| translation.executable)
}

/// Copies guest memory into `buffer`. On failure `buffer` is left untouched.
pub fn read_virtual(platform: &dyn Platform, cr3: u64, va: u64, buffer: &mut [u8]) -> Result<(), HypervisorError> {
    let mut staged = vec![0u8; buffer.len()];
    let mut offset = 0;

    for_each_chunk(va, buffer.len(), |address, len| {
        let translation = translate(platform, cr3, address)?;
        if !platform.read_physical(translation.pa, &mut staged[offset..offset + len]) {
            return Err(HypervisorError::MemoryAccessFaulted);
        }
        offset += len;
        Ok(())
    })?;

    buffer.copy_from_slice(&staged);
    Ok(())
}

/// Copies `data` into guest memory. Read-only pages are written too, as a debugger expects; the
/// whole range is translated before the first byte is written.
pub fn write_virtual(platform: &dyn Platform, cr3: u64, va: u64, data: &[u8]) -> Result<(), HypervisorError> {
    let mut chunks = Vec::new();
    for_each_chunk(va, data.len(), |address, len| {
        chunks.push((translate(platform, cr3, address)?.pa, len));
        Ok(())
    })?;

    let mut offset = 0;
    for (pa, len) in chunks {
        if !platform.write_physical(pa, &data[offset..offset + len]) {
            return Err(HypervisorError::MemoryAccessFaulted);
        }
        offset += len;
    }

    Ok(())
}

pub fn read_physical(platform: &dyn Platform, pa: u64, buffer: &mut [u8]) -> Result<(), HypervisorError> {
    platform.read_physical(pa, buffer).then_some(()).ok_or(HypervisorError::MemoryAccessFaulted)
}

pub fn write_physical(platform: &dyn Platform, pa: u64, data: &[u8]) -> Result<(), HypervisorError> {
    platform.write_physical(pa, data).then_some(()).ok_or(HypervisorError::MemoryAccessFaulted)
}

pub fn read_u64(platform: &dyn Platform, cr3: u64, va: u64) -> Result<u64, HypervisorError> {
    let mut raw = [0u8; 8];
    read_virtual(platform, cr3, va, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

pub fn write_u64(platform: &dyn Platform, cr3: u64, va: u64, value: u64) -> Result<(), HypervisorError> {
    write_virtual(platform, cr3, va, &value.to_le_bytes())
}

/// Finds every occurrence of `pattern` in `[start, start + length)`, up to `limit` matches.
///
/// Unmapped pages inside the range are skipped rather than failing the search.
pub fn search(
    platform: &dyn Platform,
    cr3: u64,
    start: u64,
    length: u64,
    pattern: &[u8],
    limit: usize,
) -> Vec<u64> {
    let mut matches = Vec::new();
    if pattern.is_empty() || length < pattern.len() as u64 {
        return matches;
    }

    let end = start.saturating_add(length);
    let mut page = start & !(PAGE_SIZE - 1);
    // Window holds the tail of the previous page so patterns spanning a boundary are found.
    let mut window: Vec<u8> = Vec::new();
    let mut window_base = start;

    while page < end && matches.len() < limit {
        let from = page.max(start);
        let to = (page + PAGE_SIZE).min(end);
        let mut bytes = vec![0u8; (to - from) as usize];

        if read_virtual(platform, cr3, from, &mut bytes).is_ok() {
            if window_base + window.len() as u64 != from {
                window.clear();
                window_base = from;
            }
            window.extend_from_slice(&bytes);

            let scanned = window.len().saturating_sub(pattern.len() - 1);
            for index in (0..window.len()).filter(|index| window[*index..].starts_with(pattern)) {
                matches.push(window_base + index as u64);
                if matches.len() >= limit {
                    break;
                }
            }

            window.drain(..scanned);
            window_base += scanned as u64;
        } else {
            window.clear();
        }

        page += PAGE_SIZE;
    }

    matches
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform, proptest::prelude::*};

    #[test]
    fn test_translate_and_query() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        let frames = platform.map_bytes(cr3, 0x7FF0_0000_1000, &[0x90; 16]);

        let translation = translate(&platform, cr3, 0x7FF0_0000_1008).unwrap();
        assert_eq!(translation.pa, frames[0] + 8);
        assert_eq!(translation.page_size, PAGE_SIZE);
        assert!(translation.writable && translation.executable);

        let query = query_pte(&platform, cr3, 0x7FF0_0000_1008);
        assert!(query.pml4e.is_some() && query.pdpte.is_some() && query.pde.is_some());
        assert_eq!(PageEntry(query.pte.unwrap().value).address(), frames[0]);

        assert_eq!(translate(&platform, cr3, 0x7FF0_0000_3000), Err(HypervisorError::MemoryAccessFaulted));
        assert!(!check_access(&platform, cr3, 0xFFFF_8000_0000_0000 - 0x10, 8));
    }

    #[test]
    fn test_check_access_crossing_into_unmapped_page() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x1000, &[0u8; 0x1000]);

        assert!(check_access(&platform, cr3, 0x1FF8, 8));
        assert!(!check_access(&platform, cr3, 0x1FFC, 8));

        let mut buffer = [0xEEu8; 8];
        assert!(read_virtual(&platform, cr3, 0x1FFC, &mut buffer).is_err());
        assert_eq!(buffer, [0xEE; 8]);
    }

    #[test]
    fn test_write_ignores_read_only_bit() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        let frame = platform.create_address_space();
        platform.map_page(cr3, 0x5000, frame, false);

        assert!(!translate(&platform, cr3, 0x5000).unwrap().writable);
        write_u64(&platform, cr3, 0x5010, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(read_u64(&platform, cr3, 0x5010).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_search_finds_pattern_across_pages() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        let mut bytes = vec![0u8; 0x2000];
        bytes[0xFFE..0x1002].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        bytes[0x1800..0x1804].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        platform.map_bytes(cr3, 0x10000, &bytes);

        let found = search(&platform, cr3, 0x10000, 0x2000, &[0xDE, 0xAD, 0xBE, 0xEF], 16);
        assert_eq!(found, vec![0x10FFE, 0x11800]);
        assert_eq!(search(&platform, cr3, 0x10000, 0x2000, &[0xDE, 0xAD, 0xBE, 0xEF], 1).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_read_after_write_returns_written_bytes(offset in 0u64..0x1F00, data in proptest::collection::vec(any::<u8>(), 1..256)) {
            let platform = MockPlatform::new(1);
            let cr3 = platform.create_address_space();
            platform.map_bytes(cr3, 0x40_0000, &[0u8; 0x2000]);

            let va = 0x40_0000 + offset;
            let len = data.len().min((0x2000 - offset) as usize);
            prop_assert!(check_access(&platform, cr3, va, len));

            write_virtual(&platform, cr3, va, &data[..len]).unwrap();
            let mut read_back = vec![0u8; len];
            read_virtual(&platform, cr3, va, &mut read_back).unwrap();
            prop_assert_eq!(&read_back[..], &data[..len]);
        }
    }
}
