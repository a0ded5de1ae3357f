//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//!
//! The guest-physical address space is identity mapped with 2MB pages. A large page is split
//! into 4KB pages the first time a hook needs per-page rights; the page tables used for splits
//! are reserved ahead of time because VMX root cannot allocate.

use {
    super::{
        mtrr::{Mtrr, MtrrRangeDescriptor},
        page_align, pd_index, pdpt_index, pml4_index, pt_index, AccessType, EptEntry, Table,
        ENTRIES, LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE,
    },
    crate::{error::HypervisorError, intel::invept::eptp_from_pml4, platform::Platform},
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    zerocopy::FromZeros,
};

/// Identity-mapped range covered by the single PML4 entry in use.
pub const IDENTITY_MAPPED_LIMIT: u64 = 512 * 1024 * 1024 * 1024;

/// Details of an access the EPT does not permit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EptViolation {
    pub guest_pa: u64,
    pub attempted: AccessType,
    pub allowed: AccessType,
}

/// The extended page tables of the guest.
pub struct Ept {
    pml4: Box<Table>,
    pdpt: Box<Table>,
    pd: Vec<Box<Table>>,

    /// Page tables of split 2MB pages, keyed by (PDPT index, PD index).
    pt: BTreeMap<(usize, usize), Box<Table>>,

    /// Zeroed tables available to `split_2mb`.
    spare_tables: Vec<Box<Table>>,

    pml4_pa: u64,
}

impl Ept {
    /// Builds an identity map with 2MB pages and full rights, using the MTRRs for memory types.
    pub fn new(platform: &dyn Platform, mtrr_map: &[MtrrRangeDescriptor]) -> Result<Self, HypervisorError> {
        log::info!("Building identity map for EPT");

        let mut pml4 = Self::allocate_table()?;
        let mut pdpt = Self::allocate_table()?;
        let mut pd = Vec::with_capacity(ENTRIES);

        for pdpt_idx in 0..ENTRIES {
            let mut table = Self::allocate_table()?;

            for (pd_idx, slot) in table.entries.iter_mut().enumerate() {
                let pa = ((pdpt_idx * ENTRIES + pd_idx) as u64) * LARGE_PAGE_SIZE;
                let mut entry = EptEntry(0);
                entry.set_access(AccessType::READ_WRITE_EXECUTE);
                entry.set_memory_type(Mtrr::find(mtrr_map, pa..pa + LARGE_PAGE_SIZE) as u64);
                entry.set_large(true);
                entry.set_pfn(pa >> PAGE_SHIFT);
                *slot = entry.0;
            }

            let mut pdpte = EptEntry(0);
            pdpte.set_access(AccessType::READ_WRITE_EXECUTE);
            pdpte.set_pfn(platform.host_physical_address(table.as_ref() as *const Table as u64) >> PAGE_SHIFT);
            pdpt.entries[pdpt_idx] = pdpte.0;

            pd.push(table);
        }

        let mut pml4e = EptEntry(0);
        pml4e.set_access(AccessType::READ_WRITE_EXECUTE);
        pml4e.set_pfn(platform.host_physical_address(pdpt.as_ref() as *const Table as u64) >> PAGE_SHIFT);
        pml4.entries[0] = pml4e.0;

        let pml4_pa = platform.host_physical_address(pml4.as_ref() as *const Table as u64);
        if pml4_pa & (PAGE_SIZE - 1) != 0 {
            return Err(HypervisorError::InvalidEptPml4BaseAddress);
        }

        log::info!("Identity map for EPT built successfully!");

        Ok(Self {
            pml4,
            pdpt,
            pd,
            pt: BTreeMap::new(),
            spare_tables: Vec::new(),
            pml4_pa,
        })
    }

    fn allocate_table() -> Result<Box<Table>, HypervisorError> {
        Table::new_box_zeroed().map_err(|_| HypervisorError::OutOfPool)
    }

    /// Reserves page tables for future splits. Must run outside VMX root.
    pub fn reserve_split_tables(&mut self, count: usize) -> Result<(), HypervisorError> {
        for _ in 0..count {
            self.spare_tables.push(Self::allocate_table()?);
        }
        log::info!("Reserved {} EPT split tables", count);
        Ok(())
    }

    pub fn spare_tables(&self) -> usize {
        self.spare_tables.len()
    }

    /// EPT pointer with a write-back walk of 4 levels.
    pub fn eptp(&self) -> u64 {
        eptp_from_pml4(self.pml4_pa)
    }

    fn check_range(guest_pa: u64) -> Result<(), HypervisorError> {
        if guest_pa >= IDENTITY_MAPPED_LIMIT {
            return Err(HypervisorError::MemoryAccessFaulted);
        }
        Ok(())
    }

    pub fn is_split(&self, guest_pa: u64) -> bool {
        self.pt.contains_key(&(pdpt_index(guest_pa), pd_index(guest_pa)))
    }

    /// Splits the 2MB page containing `guest_pa` into 512 4KB pages with the same rights and
    /// memory type. Splitting an already split page is a no-op.
    ///
    /// Fails with `OutOfPool` and leaves the tables unchanged when no spare table is reserved.
    pub fn split_2mb(&mut self, platform: &dyn Platform, guest_pa: u64) -> Result<(), HypervisorError> {
        Self::check_range(guest_pa)?;

        let key = (pdpt_index(guest_pa), pd_index(guest_pa));
        if self.pt.contains_key(&key) {
            return Ok(());
        }

        log::trace!("Splitting 2MB page at {:#x} into 4KB pages", guest_pa);

        let Some(mut table) = self.spare_tables.pop() else {
            log::warn!("No spare EPT table left to split {:#x}", guest_pa);
            return Err(HypervisorError::OutOfPool);
        };

        let large = EptEntry(self.pd[key.0].entries[key.1]);
        let base = large.address();

        for (index, slot) in table.entries.iter_mut().enumerate() {
            let mut entry = EptEntry(0);
            entry.set_access(large.access());
            entry.set_memory_type(large.memory_type());
            entry.set_pfn((base >> PAGE_SHIFT) + index as u64);
            *slot = entry.0;
        }

        let mut pde = EptEntry(0);
        pde.set_access(AccessType::READ_WRITE_EXECUTE);
        pde.set_pfn(platform.host_physical_address(table.as_ref() as *const Table as u64) >> PAGE_SHIFT);

        self.pt.insert(key, table);
        self.pd[key.0].entries[key.1] = pde.0;

        Ok(())
    }

    /// Joins a split page back into a 2MB page when every 4KB entry is again the identity
    /// mapping with full rights. Returns whether the page was joined.
    pub fn try_merge_2mb(&mut self, guest_pa: u64) -> bool {
        let key = (pdpt_index(guest_pa), pd_index(guest_pa));
        let Some(table) = self.pt.get(&key) else {
            return false;
        };

        let base = ((key.0 * ENTRIES + key.1) as u64) * LARGE_PAGE_SIZE;
        let memory_type = EptEntry(table.entries[0]).memory_type();

        let pristine = table.entries.iter().enumerate().all(|(index, raw)| {
            let entry = EptEntry(*raw);
            entry.access() == AccessType::READ_WRITE_EXECUTE
                && entry.memory_type() == memory_type
                && entry.address() == base + index as u64 * PAGE_SIZE
        });

        if !pristine {
            return false;
        }

        let mut large = EptEntry(0);
        large.set_access(AccessType::READ_WRITE_EXECUTE);
        large.set_memory_type(memory_type);
        large.set_large(true);
        large.set_pfn(base >> PAGE_SHIFT);
        self.pd[key.0].entries[key.1] = large.0;

        if let Some(mut table) = self.pt.remove(&key) {
            table.entries.fill(0);
            self.spare_tables.push(table);
        }

        true
    }

    /// Returns the leaf entry (2MB or 4KB) that maps `guest_pa`.
    pub fn entry(&self, guest_pa: u64) -> Option<EptEntry> {
        if guest_pa >= IDENTITY_MAPPED_LIMIT {
            return None;
        }

        let key = (pdpt_index(guest_pa), pd_index(guest_pa));
        match self.pt.get(&key) {
            Some(table) => Some(EptEntry(table.entries[pt_index(guest_pa)])),
            None => Some(EptEntry(self.pd[key.0].entries[key.1])),
        }
    }

    fn pte_mut(&mut self, guest_pa: u64) -> Result<&mut u64, HypervisorError> {
        let key = (pdpt_index(guest_pa), pd_index(guest_pa));
        self.pt
            .get_mut(&key)
            .map(|table| &mut table.entries[pt_index(guest_pa)])
            .ok_or(HypervisorError::HookInstallFailed)
    }

    /// Sets the rights of the 4KB page containing `guest_pa`, splitting its 2MB page if needed.
    /// Returns the previous entry.
    pub fn set_page_permissions(
        &mut self,
        platform: &dyn Platform,
        guest_pa: u64,
        access: AccessType,
    ) -> Result<EptEntry, HypervisorError> {
        self.split_2mb(platform, guest_pa)?;

        let slot = self.pte_mut(guest_pa)?;
        let previous = EptEntry(*slot);
        let mut entry = previous;
        entry.set_access(access);
        *slot = entry.0;

        log::trace!("EPT page {:#x}: {:?} -> {:?}", page_align(guest_pa), previous.access(), access);
        Ok(previous)
    }

    /// Points the 4KB page containing `guest_pa` at `host_pa` with the given rights. Returns the
    /// previous entry.
    pub fn remap_page(
        &mut self,
        platform: &dyn Platform,
        guest_pa: u64,
        host_pa: u64,
        access: AccessType,
    ) -> Result<EptEntry, HypervisorError> {
        self.split_2mb(platform, guest_pa)?;

        let slot = self.pte_mut(guest_pa)?;
        let previous = EptEntry(*slot);
        let mut entry = previous;
        entry.set_access(access);
        entry.set_pfn(host_pa >> PAGE_SHIFT);
        *slot = entry.0;

        Ok(previous)
    }

    /// Writes back an entry saved from `set_page_permissions` or `remap_page`.
    pub fn restore_entry(&mut self, guest_pa: u64, entry: EptEntry) -> Result<(), HypervisorError> {
        *self.pte_mut(guest_pa)? = entry.0;
        Ok(())
    }

    /// Walks the tables the way the processor does for an access of kind `access`.
    ///
    /// Returns the host physical address, or the violation the access would raise.
    pub fn translate(&self, guest_pa: u64, access: AccessType) -> Result<u64, EptViolation> {
        let not_present = EptViolation { guest_pa, attempted: access, allowed: AccessType::empty() };

        if pml4_index(guest_pa) != 0 || !EptEntry(self.pml4.entries[0]).is_present() {
            return Err(not_present);
        }

        let pdpte = EptEntry(self.pdpt.entries[pdpt_index(guest_pa)]);
        let Some(leaf) = self.entry(guest_pa) else {
            return Err(not_present);
        };

        let allowed = pdpte.access() & leaf.access();
        if !allowed.contains(access) {
            return Err(EptViolation { guest_pa, attempted: access, allowed });
        }

        let offset_mask = if leaf.large() { LARGE_PAGE_SIZE - 1 } else { PAGE_SIZE - 1 };
        Ok(leaf.address() | (guest_pa & offset_mask))
    }

    /// Flushes cached translations of this EPT.
    pub fn invalidate(&self, platform: &dyn Platform) {
        platform.invept(crate::intel::invept::InveptType::SingleContext, self.eptp());
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    fn build() -> (MockPlatform, Ept) {
        let platform = MockPlatform::new(1);
        let ept = Ept::new(&platform, &[]).unwrap();
        (platform, ept)
    }

    #[test]
    fn test_identity_map() {
        let (_platform, ept) = build();

        assert_eq!(ept.translate(0x1234_5678, AccessType::READ), Ok(0x1234_5678));
        assert_eq!(ept.translate(0x7F_FFFF_F000, AccessType::EXECUTE), Ok(0x7F_FFFF_F000));
        assert!(ept.translate(IDENTITY_MAPPED_LIMIT, AccessType::READ).is_err());
        assert!(ept.entry(0x20_0000).unwrap().large());
        assert_eq!(ept.entry(0x20_0000).unwrap().memory_type(), Mtrr::WriteBack as u64);
    }

    #[test]
    fn test_split_requires_spare_table() {
        let (platform, mut ept) = build();

        assert_eq!(ept.split_2mb(&platform, 0x40_0000), Err(HypervisorError::OutOfPool));
        assert!(!ept.is_split(0x40_0000));

        ept.reserve_split_tables(1).unwrap();
        ept.split_2mb(&platform, 0x40_1000).unwrap();

        assert!(ept.is_split(0x40_0000));
        assert_eq!(ept.spare_tables(), 0);
        assert_eq!(ept.translate(0x40_1234, AccessType::WRITE), Ok(0x40_1234));
        assert!(!ept.entry(0x40_1000).unwrap().large());
    }

    #[test]
    fn test_permissions_and_violation() {
        let (platform, mut ept) = build();
        ept.reserve_split_tables(1).unwrap();

        let previous = ept.set_page_permissions(&platform, 0x3000, AccessType::EXECUTE).unwrap();
        assert_eq!(previous.access(), AccessType::READ_WRITE_EXECUTE);

        assert_eq!(ept.translate(0x3010, AccessType::EXECUTE), Ok(0x3010));
        assert_eq!(
            ept.translate(0x3010, AccessType::READ),
            Err(EptViolation { guest_pa: 0x3010, attempted: AccessType::READ, allowed: AccessType::EXECUTE })
        );
        assert_eq!(ept.translate(0x4010, AccessType::READ), Ok(0x4010));
    }

    #[test]
    fn test_remap_restore_and_merge() {
        let (platform, mut ept) = build();
        ept.reserve_split_tables(1).unwrap();

        let before = ept.entry(0x5000).unwrap();
        let saved = ept.remap_page(&platform, 0x5000, 0x9_9999_9000, AccessType::EXECUTE).unwrap();

        assert_eq!(ept.translate(0x5004, AccessType::EXECUTE), Ok(0x9_9999_9004));

        ept.restore_entry(0x5000, saved).unwrap();
        assert_eq!(ept.translate(0x5004, AccessType::READ), Ok(0x5004));

        assert!(ept.try_merge_2mb(0x5000));
        assert_eq!(ept.entry(0x5000).unwrap(), before);
        assert_eq!(ept.spare_tables(), 1);
    }
}
