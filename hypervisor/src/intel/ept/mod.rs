//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//! The extended page-table mechanism (EPT) is a feature that can be used to support the virtualization of physical memory.
//! When EPT is in use, certain addresses that would normally be treated as physical addresses (and used to access memory) are instead treated as guest-physical addresses
//! Guest-physical addresses are translated by traversing a set of EPT paging structures to produce physical addresses that are used to access memory.

use {bitfield::bitfield, bitflags::bitflags, zerocopy::FromZeros};

pub mod mtrr;
pub mod paging;

pub const PAGE_SIZE: u64 = 0x1000;
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;
pub const PAGE_SHIFT: u64 = 12;

/// Number of entries in every EPT paging structure.
pub const ENTRIES: usize = 512;

bitflags! {
    /// Access rights of an EPT entry, and the kind of access that caused a violation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct AccessType: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// One EPT paging structure (PML4, PDPT, PD or PT).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
#[repr(C, align(4096))]
#[derive(FromZeros)]
pub struct Table {
    pub entries: [u64; ENTRIES],
}

bitfield! {
    /// Represents an Extended Page Table Entry (EPT Entry).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 29-1 through Table 29-6
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptEntry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl EptEntry {
    pub fn access(&self) -> AccessType {
        let mut access = AccessType::empty();
        access.set(AccessType::READ, self.readable());
        access.set(AccessType::WRITE, self.writable());
        access.set(AccessType::EXECUTE, self.executable());
        access
    }

    pub fn set_access(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }

    pub fn is_present(&self) -> bool {
        self.0 & 0b111 != 0
    }

    pub fn address(&self) -> u64 {
        self.pfn() << PAGE_SHIFT
    }
}

pub fn pml4_index(gpa: u64) -> usize {
    ((gpa >> 39) & 0x1FF) as usize
}

pub fn pdpt_index(gpa: u64) -> usize {
    ((gpa >> 30) & 0x1FF) as usize
}

pub fn pd_index(gpa: u64) -> usize {
    ((gpa >> 21) & 0x1FF) as usize
}

pub fn pt_index(gpa: u64) -> usize {
    ((gpa >> 12) & 0x1FF) as usize
}

pub fn page_align(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_access_round_trip() {
        let mut entry = EptEntry(0);
        entry.set_access(AccessType::EXECUTE);
        entry.set_pfn(0x1234);

        assert_eq!(entry.access(), AccessType::EXECUTE);
        assert_eq!(entry.0, 0x1234_004);
        assert_eq!(entry.address(), 0x1234_000);
    }

    #[test]
    fn test_indexes() {
        let gpa = 0x0000_0040_8060_3000u64;
        assert_eq!(pml4_index(gpa), 0);
        assert_eq!(pdpt_index(gpa), 0x102);
        assert_eq!(pd_index(gpa), 3);
        assert_eq!(pt_index(gpa), 0x3);
    }
}
