//! Memory Type Range Registers (MTRRs).
//!
//! The EPT identity map carries a memory type per entry; it is taken from the variable-range
//! MTRRs so that the guest keeps the caching behaviour the firmware configured.

use {
    crate::platform::Platform,
    alloc::vec::Vec,
    x86::msr::{IA32_MTRRCAP, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0},
};

/// Represents the different types of memory as defined by MTRRs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtrr {
    /// Memory type: Uncacheable (UC)
    Uncacheable = 0,
    /// Memory type: Write-combining (WC)
    WriteCombining = 1,
    /// Memory type: Write-through (WT)
    WriteThrough = 4,
    /// Memory type: Write-protected (WP)
    WriteProtected = 5,
    /// Memory type: Write-back (WB)
    WriteBack = 6,
}

impl Mtrr {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Mtrr::Uncacheable),
            1 => Some(Mtrr::WriteCombining),
            4 => Some(Mtrr::WriteThrough),
            5 => Some(Mtrr::WriteProtected),
            6 => Some(Mtrr::WriteBack),
            _ => None,
        }
    }

    /// Builds a map of the enabled, non write-back MTRR ranges.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11.1 MTRR Feature Identification
    /// - Figure 12-5. IA32_MTRRCAP Register
    pub fn build_mtrr_map(platform: &dyn Platform) -> Vec<MtrrRangeDescriptor> {
        let count = platform.rdmsr(IA32_MTRRCAP).unwrap_or(0) & 0xFF;
        let mut descriptors = Vec::new();

        for index in 0..count as u32 {
            let base = platform.rdmsr(IA32_MTRR_PHYSBASE0 + index * 2).unwrap_or(0);
            let mask = platform.rdmsr(IA32_MTRR_PHYSMASK0 + index * 2).unwrap_or(0);

            let Some(item) = MtrrItem::from_raw(base, mask) else {
                continue;
            };

            // Write-back is the default type and needs no descriptor.
            if item.is_enabled && item.mem_type != Mtrr::WriteBack {
                let descriptor = MtrrRangeDescriptor {
                    base_address: item.base,
                    end_address: item.end_address(),
                    memory_type: item.mem_type,
                };
                log::info!(
                    "MTRR Range: Base=0x{:x} End=0x{:x} Type={:?}",
                    descriptor.base_address,
                    descriptor.end_address,
                    descriptor.memory_type
                );
                descriptors.push(descriptor);
            }
        }

        log::info!("Total MTRR Ranges Committed: {}", descriptors.len());
        descriptors
    }

    /// Finds the memory type for a physical range. Uncacheable wins over every other type; a
    /// range not covered by any descriptor is write-back.
    pub fn find(mtrr_map: &[MtrrRangeDescriptor], range: core::ops::Range<u64>) -> Mtrr {
        let mut memory_type = Mtrr::WriteBack;

        for descriptor in mtrr_map {
            let overlaps = range.start <= descriptor.end_address && range.end > descriptor.base_address;
            if overlaps {
                if descriptor.memory_type == Mtrr::Uncacheable {
                    return Mtrr::Uncacheable;
                }
                memory_type = descriptor.memory_type;
            }
        }

        memory_type
    }
}

/// Describes a specific MTRR memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrRangeDescriptor {
    pub base_address: u64,
    /// Inclusive end address.
    pub end_address: u64,
    pub memory_type: Mtrr,
}

/// Represents the configuration of a single variable-range MTRR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrItem {
    pub base: u64,
    pub mask: u64,
    pub mem_type: Mtrr,
    pub is_enabled: bool,
}

impl MtrrItem {
    const ADDR_MASK: u64 = !0xFFF;
    const VALID: u64 = 1 << 11;

    pub fn from_raw(base: u64, mask: u64) -> Option<Self> {
        Some(Self {
            base: base & Self::ADDR_MASK,
            mask: mask & Self::ADDR_MASK,
            mem_type: Mtrr::from_raw(base as u8)?,
            is_enabled: mask & Self::VALID != 0,
        })
    }

    /// The range size is given by the lowest set bit of the mask.
    fn end_address(&self) -> u64 {
        if self.mask == 0 {
            return self.base;
        }
        let size = 1u64 << self.mask.trailing_zeros();
        self.base + size - 1
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_build_map_skips_write_back_and_disabled() {
        let platform = MockPlatform::new(1);
        platform.set_msr(IA32_MTRRCAP, 3);
        // 0xC0000000..0xFFFFFFFF uncacheable
        platform.set_msr(IA32_MTRR_PHYSBASE0, 0xC000_0000);
        platform.set_msr(IA32_MTRR_PHYSMASK0, 0xF_C000_0000 | 0x800);
        // write-back, skipped
        platform.set_msr(IA32_MTRR_PHYSBASE0 + 2, 0x6);
        platform.set_msr(IA32_MTRR_PHYSMASK0 + 2, 0xF_8000_0000 | 0x800);
        // disabled
        platform.set_msr(IA32_MTRR_PHYSBASE0 + 4, 0x1000_0001);
        platform.set_msr(IA32_MTRR_PHYSMASK0 + 4, 0xF_F000_0000);

        let map = Mtrr::build_mtrr_map(&platform);

        assert_eq!(map.len(), 1);
        assert_eq!(map[0].base_address, 0xC000_0000);
        assert_eq!(map[0].end_address, 0xFFFF_FFFF);
        assert_eq!(Mtrr::find(&map, 0xC000_0000..0xC020_0000), Mtrr::Uncacheable);
        assert_eq!(Mtrr::find(&map, 0..0x20_0000), Mtrr::WriteBack);
    }
}
