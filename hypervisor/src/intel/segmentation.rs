//! Decoding of GDT entries into the base, limit and access-rights triples the VMCS guest and host
//! state areas expect.

use {
    bit_field::BitField,
    bitflags::bitflags,
    x86::segmentation::SegmentSelector,
    x86_64::structures::gdt::DescriptorFlags,
};

bitflags! {
    /// Access rights for VMCS guest register states.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
    /// and Table 25-2. Format of Access Rights.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        const ACCESSED = 1 << 0;
        /// Readable (code) or writable (data).
        const RW = 1 << 1;
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Descriptor type (0 = system; 1 = code or data).
        const CODE_DATA = 1 << 4;
        const DPL_MASK = 3 << 5;
        const PRESENT = 1 << 7;
        /// 64-bit code segment (CS only).
        const LONG_MODE = 1 << 13;
        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment).
        const DB = 1 << 14;
        const GRANULARITY = 1 << 15;
        /// Segment unusable (0 = usable; 1 = unusable).
        const UNUSABLE = 1 << 16;
    }
}

impl SegmentAccessRights {
    /// Extracts the access rights held in bits 40..56 of a descriptor. Bits 8..12 of that range
    /// are the limit's upper nibble and are dropped.
    pub fn from_descriptor(descriptor: u64) -> Self {
        Self::from_bits_truncate(descriptor.get_bits(40..56) as u32 & 0xF0FF)
    }
}

/// A decoded segment descriptor.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
/// and Figure 3-8. Segment Descriptor
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub selector: SegmentSelector,
    pub base_address: u64,
    /// Byte-granular limit, already scaled when the granularity flag is set.
    pub segment_limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl SegmentDescriptor {
    /// A null or non-present segment.
    pub const fn unusable(selector: SegmentSelector) -> Self {
        Self {
            selector,
            base_address: 0,
            segment_limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Looks `selector` up in `gdt`.
    ///
    /// Null selectors, LDT selectors, selectors past the end of the table and non-present entries
    /// decode as unusable. System descriptors (TSS, LDT) take the upper half of their base from
    /// the following entry.
    ///
    /// # Arguments
    ///
    /// * `selector` - The segment selector to decode.
    /// * `gdt` - The entries of the global descriptor table.
    pub fn from_selector(selector: SegmentSelector, gdt: &[u64]) -> Self {
        let index = selector.index() as usize;
        if index == 0 || selector.contains(SegmentSelector::TI_LDT) {
            return Self::unusable(selector);
        }

        let Some(&entry_value) = gdt.get(index) else {
            return Self::unusable(selector);
        };

        let entry = DescriptorFlags::from_bits_truncate(entry_value);
        if !entry.contains(DescriptorFlags::PRESENT) {
            return Self::unusable(selector);
        }

        let mut base_address = entry_value.get_bits(16..40) | (entry_value.get_bits(56..64) << 24);
        if !entry.contains(DescriptorFlags::USER_SEGMENT) {
            let high = gdt.get(index + 1).copied().unwrap_or(0);
            base_address |= high.get_bits(0..32) << 32;
        }

        let mut segment_limit = entry_value.get_bits(0..16) | (entry_value.get_bits(48..52) << 16);
        if entry.contains(DescriptorFlags::GRANULARITY) {
            segment_limit = (segment_limit << 12) | 0xFFF;
        }

        Self {
            selector,
            base_address,
            segment_limit: segment_limit as u32,
            access_rights: SegmentAccessRights::from_descriptor(entry_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Null, kernel code, kernel data and a 16-byte TSS at 0xFFFF_F800_1234_5678.
    fn gdt() -> [u64; 5] {
        [
            0,
            0x0020_9B00_0000_0000,
            0x00CF_9300_0000_FFFF,
            0x1200_8B34_5678_0067,
            0x0000_0000_FFFF_F800,
        ]
    }

    #[test]
    fn test_long_mode_code_segment() {
        let cs = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x8), &gdt());

        assert_eq!(cs.base_address, 0);
        assert_eq!(cs.access_rights.bits(), 0x209B);
        assert!(cs.access_rights.contains(SegmentAccessRights::LONG_MODE));
    }

    #[test]
    fn test_flat_data_segment_limit_is_scaled() {
        let ds = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x13), &gdt());

        assert_eq!(ds.segment_limit, 0xFFFF_FFFF);
        assert_eq!(ds.access_rights.bits(), 0xC093);
    }

    #[test]
    fn test_tss_base_spans_two_entries() {
        let tr = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x18), &gdt());

        assert_eq!(tr.base_address, 0xFFFF_F800_1234_5678);
        assert_eq!(tr.segment_limit, 0x67);
        assert_eq!(tr.access_rights.bits(), 0x8B);
    }

    #[test]
    fn test_null_and_out_of_range_selectors_are_unusable() {
        let null = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0), &gdt());
        let past_end = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x50), &gdt());

        assert_eq!(null.access_rights, SegmentAccessRights::UNUSABLE);
        assert_eq!(past_end.access_rights, SegmentAccessRights::UNUSABLE);
    }
}
