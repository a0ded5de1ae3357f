//! Global and interrupt descriptor tables of the guest and of the host.
//!
//! The guest keeps the tables the operating system loaded. The host runs on a private copy of the
//! GDT and on the IDT built in [`crate::intel::idt`], so that faults raised while handling an exit
//! never reach the operating system's handlers.

use {
    crate::intel::segmentation::SegmentDescriptor,
    alloc::vec::Vec,
    x86::segmentation::SegmentSelector,
};

/// The base and limit loaded into GDTR or IDTR.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 2.4.1 Global Descriptor Table Register (GDTR)
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

impl TableRegister {
    /// Number of 8-byte entries covered by the limit.
    pub fn entry_count(&self) -> usize {
        (usize::from(self.limit) + 1) / core::mem::size_of::<u64>()
    }
}

/// A GDT snapshot together with the table registers that describe it.
pub struct DescriptorTables {
    /// The GDT entries, used to decode segment selectors.
    pub global_descriptor_table: Vec<u64>,
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
}

impl DescriptorTables {
    /// Wraps tables that stay where the operating system put them.
    ///
    /// # Arguments
    ///
    /// * `gdtr` - The guest's GDTR.
    /// * `idtr` - The guest's IDTR.
    /// * `entries` - A copy of the GDT entries `gdtr` points at.
    pub fn new(gdtr: TableRegister, idtr: TableRegister, entries: Vec<u64>) -> Self {
        Self {
            global_descriptor_table: entries,
            gdtr,
            idtr,
        }
    }

    /// Builds host tables: a private copy of this GDT and the given IDT.
    ///
    /// The returned GDTR points at the copy, which lives as long as the returned value.
    pub fn host_copy(&self, idtr: TableRegister) -> Self {
        let global_descriptor_table = self.global_descriptor_table.clone();
        let gdtr = TableRegister {
            base: global_descriptor_table.as_ptr() as u64,
            limit: self.gdtr.limit,
        };

        Self {
            global_descriptor_table,
            gdtr,
            idtr,
        }
    }

    /// Decodes `selector` against this GDT.
    pub fn segment(&self, selector: u16) -> SegmentDescriptor {
        SegmentDescriptor::from_selector(SegmentSelector::from_raw(selector), &self.global_descriptor_table)
    }

    /// Captures the GDT and IDT loaded on the current processor.
    #[cfg(windows)]
    pub fn capture() -> Self {
        let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
        unsafe {
            x86::dtables::sgdt(&mut gdtr);
            x86::dtables::sidt(&mut idtr);
        }

        let gdtr = TableRegister { base: gdtr.base as u64, limit: gdtr.limit };
        let idtr = TableRegister { base: idtr.base as u64, limit: idtr.limit };
        let entries = unsafe { core::slice::from_raw_parts(gdtr.base as *const u64, gdtr.entry_count()) }.to_vec();

        Self::new(gdtr, idtr, entries)
    }

    /// Loads `gdtr` and `idtr` into the current processor.
    #[cfg(windows)]
    pub fn load(gdtr: TableRegister, idtr: TableRegister) {
        let gdt = x86::dtables::DescriptorTablePointer::<u64> { limit: gdtr.limit, base: gdtr.base as *const u64 };
        let idt = x86::dtables::DescriptorTablePointer::<u64> { limit: idtr.limit, base: idtr.base as *const u64 };
        unsafe {
            x86::dtables::lgdt(&gdt);
            x86::dtables::lidt(&idt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_copy_points_at_private_gdt() {
        let entries = alloc::vec![0, 0x0020_9B00_0000_0000, 0x00CF_9300_0000_FFFF];
        let guest = DescriptorTables::new(
            TableRegister { base: 0xFFFF_F800_0000_1000, limit: 0x17 },
            TableRegister { base: 0xFFFF_F800_0000_2000, limit: 0xFFF },
            entries,
        );

        let host = guest.host_copy(TableRegister { base: 0x5000, limit: 0xFFF });

        assert_eq!(host.gdtr.base, host.global_descriptor_table.as_ptr() as u64);
        assert_eq!(host.gdtr.limit, 0x17);
        assert_eq!(host.idtr.base, 0x5000);
        assert_eq!(guest.gdtr.entry_count(), 3);
        assert_eq!(host.segment(0x8).access_rights.bits(), 0x209B);
    }
}
