//! Runtime configuration loaded from `config.ini`.
//!
//! The file uses `[section]` headers and `key=value` pairs. Section names are
//! accepted but not required; keys are matched case-insensitively.

use alloc::string::{String, ToString};

/// Default I/O base of the debugging serial port (COM1). COM2 carries the log.
pub const DEFAULT_SERIAL_PORT: u16 = 0x3f8;

/// Default per-invocation instruction budget of a script.
pub const DEFAULT_SCRIPT_MAX_INSTRUCTIONS: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Symbol server used by the debugger to fetch PDBs.
    pub symbol_server: String,

    /// Local symbol cache path.
    pub symbol_path: Option<String>,

    pub serial_port: u16,
    pub serial_baud: u32,

    /// Number of polls of the line status register before a byte read gives up.
    pub serial_byte_timeout: u32,

    /// Carry frames as base64 for channels that cannot pass the end marker.
    pub base64_transport: bool,

    pub script_max_instructions: u64,

    /// Inject #GP for guest accesses to the synthetic hypervisor MSR range while hidden.
    pub transparency_inject_msr_gp: bool,

    /// Number of hook records reserved at load time.
    pub preallocated_pools: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol_server: "SRV*c:\\Symbols*https://msdl.microsoft.com/download/symbols".to_string(),
            symbol_path: None,
            serial_port: DEFAULT_SERIAL_PORT,
            serial_baud: 115_200,
            serial_byte_timeout: 1000,
            base64_transport: false,
            script_max_instructions: DEFAULT_SCRIPT_MAX_INSTRUCTIONS,
            transparency_inject_msr_gp: cfg!(feature = "msr-gp-injection"),
            preallocated_pools: 10,
        }
    }
}

impl Config {
    /// Parses the contents of a `config.ini` file.
    ///
    /// Lines that are empty, comments (`;` or `#`), or section headers are skipped. Values that fail
    /// to parse keep their defaults.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') || line.starts_with('[') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("config.ini:{}: expected key=value", number + 1);
                continue;
            };

            config.apply(key.trim(), value.trim());
        }

        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key.to_ascii_lowercase().as_str() {
            "symbolserver" => self.symbol_server = value.to_string(),
            "symbolpath" => self.symbol_path = (!value.is_empty()).then(|| value.to_string()),
            "serialport" => set_parsed(&mut self.serial_port, key, parse_u64(value).and_then(|v| u16::try_from(v).ok())),
            "serialbaud" => set_parsed(&mut self.serial_baud, key, parse_u64(value).and_then(|v| u32::try_from(v).ok())),
            "serialbytetimeout" => set_parsed(&mut self.serial_byte_timeout, key, parse_u64(value).and_then(|v| u32::try_from(v).ok())),
            "base64transport" => set_parsed(&mut self.base64_transport, key, parse_bool(value)),
            "scriptmaxinstructions" => set_parsed(&mut self.script_max_instructions, key, parse_u64(value).filter(|v| *v != 0)),
            "transparencyinjectmsrgp" => set_parsed(&mut self.transparency_inject_msr_gp, key, parse_bool(value)),
            "preallocatedpools" => set_parsed(&mut self.preallocated_pools, key, parse_u64(value).and_then(|v| u32::try_from(v).ok())),
            _ => log::warn!("config.ini: ignoring unknown key {}", key),
        }
    }
}

fn set_parsed<T>(slot: &mut T, key: &str, value: Option<T>) {
    match value {
        Some(value) => *slot = value,
        None => log::warn!("config.ini: invalid value for {}, keeping default", key),
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal numbers.
pub fn parse_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(
            "[Settings]\n\
             ; comment\n\
             SymbolServer = SRV*d:\\sym*https://example.com/symbols\n\
             SerialPort=0x2e8\n\
             base64transport = yes\n\
             ScriptMaxInstructions=500\n",
        );

        assert_eq!(config.symbol_server, "SRV*d:\\sym*https://example.com/symbols");
        assert_eq!(config.serial_port, 0x2e8);
        assert!(config.base64_transport);
        assert_eq!(config.script_max_instructions, 500);
        assert_eq!(config.serial_baud, 115_200);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = Config::parse("SerialPort=0x1FFFF\nScriptMaxInstructions=0\nBase64Transport=maybe\nUnknown=1");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0xC0000082"), Some(0xC000_0082));
        assert_eq!(parse_u64("42"), Some(42));
        assert_eq!(parse_u64("zz"), None);
    }
}
