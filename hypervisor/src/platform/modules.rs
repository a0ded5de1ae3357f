//! Decoding of the kernel module list returned by `ZwQuerySystemInformation`.

use {
    crate::platform::LoadedModule,
    alloc::vec::Vec,
    zerocopy::{FromBytes, Immutable, KnownLayout},
};

/// `SystemModuleInformation` information class.
pub const SYSTEM_MODULE_INFORMATION: u32 = 11;

/// One record of the module list.
#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable)]
pub struct ProcessModuleInformation {
    pub section: u64,
    pub mapped_base: u64,
    pub image_base: u64,
    pub image_size: u32,
    pub flags: u32,
    pub load_order_index: u16,
    pub init_order_index: u16,
    pub load_count: u16,
    pub offset_to_file_name: u16,
    pub full_path_name: [u8; 256],
}

static_assertions::const_assert_eq!(core::mem::size_of::<ProcessModuleInformation>(), 0x128);

/// Offset of the first record: a 32-bit count padded to 8 bytes.
const MODULES_OFFSET: usize = 8;

/// Parses a module list buffer. Records past the end of `buffer` are ignored.
pub fn parse_module_list(buffer: &[u8]) -> Vec<LoadedModule> {
    let Some(count) = buffer.get(..4).map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])) else {
        return Vec::new();
    };

    buffer
        .get(MODULES_OFFSET..)
        .unwrap_or_default()
        .chunks_exact(core::mem::size_of::<ProcessModuleInformation>())
        .take(count as usize)
        .filter_map(|record| ProcessModuleInformation::read_from_bytes(record).ok())
        .map(|module| {
            let path_len = module.full_path_name.iter().position(|b| *b == 0).unwrap_or(module.full_path_name.len());
            LoadedModule {
                base: module.image_base,
                size: module.image_size,
                path: module.full_path_name[..path_len].to_vec(),
            }
        })
        .collect()
}
