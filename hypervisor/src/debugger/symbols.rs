//! Loaded modules and the symbols the debugger shipped for them.
//!
//! The engine does not parse PDBs. It records the kernel images that are loaded (base, size, path)
//! and the PDB identity the debugger found for each one, plus any `name -> rva` pairs the
//! debugger sent along. That is enough to resolve `nt!NtCreateFile` in breakpoint and script
//! commands and to print `module!symbol+offset` for an address.

use {
    crate::{error::HypervisorError, platform::Platform},
    alloc::{collections::BTreeMap, format, string::String, vec::Vec},
    bstr::ByteSlice,
    spin::RwLock,
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

pub const MODULE_NAME_LENGTH: usize = 64;
pub const MODULE_PATH_LENGTH: usize = 260;
pub const SYMBOL_NAME_LENGTH: usize = 120;

/// Kernel image file names that answer to `nt`.
const KERNEL_IMAGE_NAMES: [&[u8]; 4] = [b"ntoskrnl", b"ntkrnlmp", b"ntkrnlpa", b"ntkrpamp"];

/// One module as exchanged with the debugger.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
pub struct ModuleSymbolDetail {
    pub base_address: u64,
    pub size: u32,
    pub pdb_age: u32,
    pub pdb_guid: [u8; 16],
    pub is_pdb_available: u8,
    pub is_user_mode: u8,
    pub is_32bit: u8,
    pub reserved: u8,
    pub name: [u8; MODULE_NAME_LENGTH],
    pub file_path: [u8; MODULE_PATH_LENGTH],
}

/// One symbol as sent by the debugger.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy)]
pub struct SymbolRecord {
    pub module_base: u64,
    pub rva: u32,
    pub name: [u8; SYMBOL_NAME_LENGTH],
}

/// Identity of the PDB that describes a module.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PdbIdentity {
    pub guid: [u8; 16],
    pub age: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub base: u64,
    pub size: u32,
    /// Short name the module is addressed by, `nt` for the kernel image.
    pub name: Vec<u8>,
    pub path: Vec<u8>,
    pub pdb: Option<PdbIdentity>,
    pub is_user_mode: bool,
    pub is_32bit: bool,
    /// Lowercased symbol name to (name, rva).
    symbols: BTreeMap<Vec<u8>, (Vec<u8>, u32)>,
    /// rva to name, for reverse lookups.
    by_rva: BTreeMap<u32, Vec<u8>>,
}

impl Module {
    fn new(base: u64, size: u32, path: &[u8]) -> Self {
        Self {
            base,
            size,
            name: short_name(path),
            path: path.to_vec(),
            pdb: None,
            is_user_mode: false,
            is_32bit: false,
            symbols: BTreeMap::new(),
            by_rva: BTreeMap::new(),
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < u64::from(self.size)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    fn add_symbol(&mut self, name: &[u8], rva: u32) {
        self.symbols.insert(name.to_ascii_lowercase(), (name.to_vec(), rva));
        self.by_rva.insert(rva, name.to_vec());
    }

    fn detail(&self) -> ModuleSymbolDetail {
        let pdb = self.pdb.unwrap_or_default();
        let mut detail = ModuleSymbolDetail {
            base_address: self.base,
            size: self.size,
            pdb_age: pdb.age,
            pdb_guid: pdb.guid,
            is_pdb_available: u8::from(self.pdb.is_some()),
            is_user_mode: u8::from(self.is_user_mode),
            is_32bit: u8::from(self.is_32bit),
            reserved: 0,
            name: [0; MODULE_NAME_LENGTH],
            file_path: [0; MODULE_PATH_LENGTH],
        };
        copy_truncated(&mut detail.name, &self.name);
        copy_truncated(&mut detail.file_path, &self.path);
        detail
    }
}

/// The symbol table of the debuggee.
pub struct SymbolTable {
    modules: RwLock<Vec<Module>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self { modules: RwLock::new(Vec::new()) }
    }

    /// Rebuilds the module list from the images the platform reports as loaded.
    ///
    /// Modules that are still loaded at the same base keep their PDB identity and symbols.
    /// Returns the number of modules.
    pub fn reload(&self, platform: &dyn Platform) -> usize {
        let loaded = platform.loaded_modules();
        let mut modules = self.modules.write();

        let mut reloaded: Vec<Module> = loaded
            .iter()
            .map(|image| {
                let fresh = Module::new(image.base, image.size, &image.path);
                match modules.iter().position(|old| old.base == fresh.base && old.name == fresh.name) {
                    Some(index) => modules.swap_remove(index),
                    None => fresh,
                }
            })
            .collect();

        // Modules the debugger described that the platform does not list (user-mode images).
        reloaded.extend(modules.drain(..).filter(|module| module.is_user_mode));
        *modules = reloaded;

        log::info!("Symbol table reloaded with {} modules", modules.len());
        modules.len()
    }

    /// Records the PDB identity the debugger found for each module, adding modules it does not
    /// know yet.
    pub fn update(&self, details: &[ModuleSymbolDetail]) {
        let mut modules = self.modules.write();

        for detail in details {
            let base = detail.base_address;
            let path = until_nul(&detail.file_path);
            let position = modules.iter().position(|module| module.base == base);
            let module = match position {
                Some(index) => &mut modules[index],
                None => {
                    let mut module = Module::new(base, detail.size, path);
                    let name = until_nul(&detail.name);
                    if !name.is_empty() {
                        module.name = short_name(name);
                    }
                    modules.push(module);
                    let last = modules.len() - 1;
                    &mut modules[last]
                }
            };

            module.is_user_mode = detail.is_user_mode != 0;
            module.is_32bit = detail.is_32bit != 0;
            if detail.is_pdb_available != 0 {
                module.pdb = Some(PdbIdentity { guid: detail.pdb_guid, age: detail.pdb_age });
            }
        }
    }

    /// Adds symbols to the modules they belong to. Records for unknown modules are skipped.
    ///
    /// Returns the number of symbols added.
    pub fn add_symbols(&self, records: &[SymbolRecord]) -> usize {
        let mut modules = self.modules.write();
        let mut added = 0;

        for record in records {
            let base = record.module_base;
            let Some(module) = modules.iter_mut().find(|module| module.base == base) else {
                log::debug!("No module at {:#x} for {}", base, until_nul(&record.name).as_bstr());
                continue;
            };
            let name = until_nul(&record.name);
            if name.is_empty() {
                continue;
            }
            module.add_symbol(name, record.rva);
            added += 1;
        }

        added
    }

    /// Adds one module with its symbols. Used by local symbol reloads and tests.
    pub fn insert_module(&self, path: &[u8], base: u64, size: u32, symbols: &[(&[u8], u32)]) {
        let mut module = Module::new(base, size, path);
        for (name, rva) in symbols {
            module.add_symbol(name, *rva);
        }

        let mut modules = self.modules.write();
        modules.retain(|existing| existing.base != base);
        modules.push(module);
    }

    pub fn clear(&self) {
        self.modules.write().clear();
    }

    pub fn modules(&self) -> Vec<Module> {
        self.modules.read().clone()
    }

    /// Module records in wire form.
    pub fn details(&self) -> Vec<ModuleSymbolDetail> {
        self.modules.read().iter().map(Module::detail).collect()
    }

    /// Resolves an address expression.
    ///
    /// Accepted forms are `module!symbol`, `module!symbol+offset`, `module`, `module+offset` and
    /// a plain hexadecimal address with optional `0x` prefix and `` ` `` separators. Module and
    /// symbol names compare case-insensitively.
    pub fn resolve(&self, expression: &[u8]) -> Result<u64, HypervisorError> {
        let expression = expression.trim_ascii();
        if let Some(address) = parse_hex(expression) {
            return Ok(address);
        }

        let (target, offset) = match expression.rfind_byte(b'+') {
            Some(plus) => (&expression[..plus], parse_hex(&expression[plus + 1..]).ok_or(HypervisorError::SymbolNotFound)?),
            None => (expression, 0),
        };

        let (module_name, symbol_name) = match target.find_byte(b'!') {
            Some(bang) => (&target[..bang], Some(&target[bang + 1..])),
            None => (target, None),
        };

        let modules = self.modules.read();
        let module = modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(module_name))
            .ok_or(HypervisorError::SymbolNotFound)?;

        let base = match symbol_name {
            Some(symbol) => {
                let (_, rva) = module.symbols.get(&symbol.to_ascii_lowercase()).ok_or(HypervisorError::SymbolNotFound)?;
                module.base + u64::from(*rva)
            }
            None => module.base,
        };

        log::trace!("{} resolved to {:#x}", expression.as_bstr(), base.wrapping_add(offset));
        Ok(base.wrapping_add(offset))
    }

    /// Describes `address` as `module!symbol+offset`, `module+offset` or `None` when no module
    /// contains it.
    pub fn describe(&self, address: u64) -> Option<String> {
        let modules = self.modules.read();
        let module = modules.iter().find(|module| module.contains(address))?;
        let rva = (address - module.base) as u32;

        let described = match module.by_rva.range(..=rva).next_back() {
            Some((start, name)) if rva == *start => format!("{}!{}", module.name.as_bstr(), name.as_bstr()),
            Some((start, name)) => format!("{}!{}+{:#x}", module.name.as_bstr(), name.as_bstr(), rva - start),
            None => format!("{}+{:#x}", module.name.as_bstr(), rva),
        };
        Some(described)
    }
}

/// File name without directory and extension, `nt` for the kernel image.
fn short_name(path: &[u8]) -> Vec<u8> {
    let file = match path.rfind_byte(b'\\').or_else(|| path.rfind_byte(b'/')) {
        Some(separator) => &path[separator + 1..],
        None => path,
    };
    let stem = match file.rfind_byte(b'.') {
        Some(dot) => &file[..dot],
        None => file,
    };

    if KERNEL_IMAGE_NAMES.iter().any(|kernel| stem.eq_ignore_ascii_case(kernel)) {
        return b"nt".to_vec();
    }
    stem.to_ascii_lowercase()
}

fn parse_hex(text: &[u8]) -> Option<u64> {
    let digits = text.strip_prefix(b"0x").or_else(|| text.strip_prefix(b"0X")).unwrap_or(text);
    if digits.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    for byte in digits.iter().filter(|byte| **byte != b'`') {
        let digit = (*byte as char).to_digit(16)?;
        value = value.checked_mul(16)?.checked_add(u64::from(digit))?;
    }
    Some(value)
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.find_byte(0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    }
}

fn copy_truncated(target: &mut [u8], source: &[u8]) {
    let len = source.len().min(target.len() - 1);
    target[..len].copy_from_slice(&source[..len]);
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform, zerocopy::FromZeros};

    fn table() -> SymbolTable {
        let table = SymbolTable::new();
        table.insert_module(
            b"\\SystemRoot\\system32\\ntoskrnl.exe",
            0xFFFF_F800_0000_0000,
            0x0100_0000,
            &[(b"NtCreateFile", 0x12_3450), (b"NtClose", 0x12_0000)],
        );
        table.insert_module(b"\\SystemRoot\\System32\\drivers\\Ntfs.sys", 0xFFFF_F800_1000_0000, 0x20_0000, &[]);
        table
    }

    #[test]
    fn test_resolve_forms() {
        let table = table();
        assert_eq!(table.resolve(b"nt!NtCreateFile"), Ok(0xFFFF_F800_0012_3450));
        assert_eq!(table.resolve(b"NT!ntcreatefile+0x10"), Ok(0xFFFF_F800_0012_3460));
        assert_eq!(table.resolve(b"ntfs+100"), Ok(0xFFFF_F800_1000_0100));
        assert_eq!(table.resolve(b"fffff800`00001000"), Ok(0xFFFF_F800_0000_1000));
        assert_eq!(table.resolve(b" 0x1000 "), Ok(0x1000));
        assert_eq!(table.resolve(b"nt!NtOpenFile"), Err(HypervisorError::SymbolNotFound));
        assert_eq!(table.resolve(b"win32k!Foo"), Err(HypervisorError::SymbolNotFound));
    }

    #[test]
    fn test_describe_address() {
        let table = table();
        assert_eq!(table.describe(0xFFFF_F800_0012_3450).as_deref(), Some("nt!NtCreateFile"));
        assert_eq!(table.describe(0xFFFF_F800_0012_0010).as_deref(), Some("nt!NtClose+0x10"));
        assert_eq!(table.describe(0xFFFF_F800_1000_0200).as_deref(), Some("ntfs+0x200"));
        assert_eq!(table.describe(0x1000), None);
    }

    #[test]
    fn test_reload_keeps_known_modules() {
        let platform = MockPlatform::new(1);
        platform.load_module(b"\\SystemRoot\\system32\\ntoskrnl.exe", 0xFFFF_F800_0000_0000, 0x0100_0000);
        platform.load_module(b"\\SystemRoot\\System32\\drivers\\disk.sys", 0xFFFF_F800_2000_0000, 0x1_0000);

        let table = table();
        assert_eq!(table.reload(&platform), 2);
        assert_eq!(table.resolve(b"nt!NtCreateFile"), Ok(0xFFFF_F800_0012_3450));
        assert_eq!(table.resolve(b"disk"), Ok(0xFFFF_F800_2000_0000));
        assert_eq!(table.resolve(b"ntfs"), Err(HypervisorError::SymbolNotFound));
    }

    #[test]
    fn test_update_and_add_symbols() {
        let table = SymbolTable::new();

        let mut detail = ModuleSymbolDetail::new_zeroed();
        detail.base_address = 0x7FF6_0000_0000;
        detail.size = 0x1_0000;
        detail.is_pdb_available = 1;
        detail.is_user_mode = 1;
        detail.pdb_guid = [0xAB; 16];
        detail.pdb_age = 3;
        copy_truncated(&mut detail.file_path, b"C:\\Windows\\notepad.exe");
        table.update(&[detail]);

        let mut record = SymbolRecord::new_zeroed();
        record.module_base = 0x7FF6_0000_0000;
        record.rva = 0x1234;
        copy_truncated(&mut record.name, b"wWinMain");
        let mut orphan = record;
        orphan.module_base = 0x1000;
        assert_eq!(table.add_symbols(&[record, orphan]), 1);

        assert_eq!(table.resolve(b"notepad!wWinMain"), Ok(0x7FF6_0000_1234));
        let modules = table.modules();
        assert_eq!(modules[0].pdb, Some(PdbIdentity { guid: [0xAB; 16], age: 3 }));
        assert!(modules[0].is_user_mode);

        let details = table.details();
        assert_eq!(until_nul(&details[0].name), b"notepad");
        assert_eq!({ details[0].pdb_age }, 3);
    }
}
