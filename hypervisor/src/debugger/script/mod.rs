//! The bytecode evaluator behind event conditions and `RunScript` actions.
//!
//! Scripts arrive compiled; the evaluator only validates the symbol array and runs it against a
//! [`ScriptHost`] that exposes the registers, memory and engine services of the current exit.
//! Execution is bounded by an instruction budget and never touches memory without asking the
//! host, so a faulty script can stop itself but not the processor.

use {
    crate::{
        debugger::events::ModifyAction,
        error::{HypervisorError, ScriptError},
    },
    alloc::vec::Vec,
    core::sync::atomic::AtomicU64,
    zerocopy::FromBytes,
};

pub mod eval;
pub mod format;
pub mod host;
pub mod symbol;

pub use symbol::{Opcode, PseudoRegister, RegisterId, Symbol, SymbolType, SYMBOL_SIZE};

/// Upper bound on local variables a script may declare.
pub const MAX_LOCALS: usize = 1024;

/// Number of global variables shared by every script.
pub const GLOBAL_VARIABLE_COUNT: usize = 256;

/// Services a script can use during one evaluation.
pub trait ScriptHost {
    fn register(&self, register: RegisterId) -> u64;
    fn set_register(&mut self, register: RegisterId, value: u64);
    fn pseudo_register(&self, register: PseudoRegister) -> u64;

    /// Copies memory into `buffer`. Returns false without touching `buffer` when any byte is
    /// inaccessible.
    fn read_memory(&self, address: u64, buffer: &mut [u8], physical: bool) -> bool;
    fn write_memory(&mut self, address: u64, data: &[u8], physical: bool) -> bool;
    fn check_address(&self, address: u64, size: usize) -> bool;
    fn virtual_to_physical(&self, va: u64) -> Option<u64>;
    fn physical_to_virtual(&self, pa: u64) -> Option<u64>;

    fn print(&mut self, message: &str);
    fn modify_event(&mut self, tag: u64, action: ModifyAction) -> bool;
    fn set_short_circuit(&mut self, enabled: bool);
    fn inject_event(&mut self, vector: u8, error_code: Option<u32>);
    fn pause(&mut self);
    fn flush(&mut self);

    fn rdtsc(&self) -> u64;
    fn rdtscp(&self) -> (u64, u32);
    fn microsleep(&self, microseconds: u64);
    fn globals(&self) -> &[AtomicU64];
    fn test_statement(&mut self, value: u64);

    /// Code size used by `disassemble_len`.
    fn code_bitness(&self) -> u32 {
        64
    }
}

/// The result of one evaluation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub return_value: u64,
    /// A dereference failed and execution stopped there.
    pub memory_access_failed: bool,
    pub instructions: u64,
}

/// A validated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    symbols: Vec<Symbol>,
    local_count: usize,
}

impl Script {
    /// Validates a compiled blob.
    ///
    /// The blob must be a whole number of symbols, every symbol type must be known and every
    /// string must fit in the blob.
    pub fn parse(blob: &[u8]) -> Result<Self, HypervisorError> {
        if blob.is_empty() || blob.len() % SYMBOL_SIZE != 0 {
            return Err(ScriptError::MalformedBlob.into());
        }

        let symbols = <[Symbol]>::ref_from_bytes(blob).map_err(|_| ScriptError::MalformedBlob)?.to_vec();

        let mut index = 0;
        let mut local_count = 0;
        while index < symbols.len() {
            let symbol = symbols[index];
            match symbol.kind() {
                None => return Err(ScriptError::InvalidOperand(symbol.symbol_type.get()).into()),
                Some(SymbolType::String | SymbolType::WString) => {
                    let slots = string_slots(symbol.value())?;
                    if index + slots >= symbols.len() {
                        return Err(ScriptError::MalformedBlob.into());
                    }
                    index += slots;
                }
                Some(SymbolType::VariableCount) => {
                    local_count = usize::try_from(symbol.value()).map_err(|_| ScriptError::MalformedBlob)?;
                    if local_count > MAX_LOCALS {
                        return Err(ScriptError::MalformedBlob.into());
                    }
                }
                Some(_) => {}
            }
            index += 1;
        }

        Ok(Self { symbols, local_count })
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Runs the script to completion or until it faults.
    ///
    /// A failed dereference is not an error: it ends the run with `memory_access_failed` set.
    pub fn run(&self, host: &mut dyn ScriptHost, max_instructions: u64) -> Result<ScriptOutput, ScriptError> {
        eval::Evaluator::new(self, host, max_instructions).run()
    }
}

/// Number of 16-byte slots that hold a string of `length` bytes.
pub(crate) fn string_slots(length: u64) -> Result<usize, ScriptError> {
    let length = usize::try_from(length).map_err(|_| ScriptError::MalformedBlob)?;
    Ok(length.div_ceil(SYMBOL_SIZE))
}

/// Assembles symbol arrays. Used by the debugger to build small scripts of its own and by
/// tests.
#[derive(Debug, Default, Clone)]
pub struct ScriptBuilder {
    symbols: Vec<Symbol>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next symbol, usable as a jump target.
    pub fn position(&self) -> u64 {
        self.symbols.len() as u64
    }

    pub fn symbol(mut self, symbol_type: SymbolType, value: u64) -> Self {
        self.symbols.push(Symbol::new(symbol_type, value));
        self
    }

    pub fn op(self, opcode: Opcode) -> Self {
        self.symbol(SymbolType::SemanticRule, opcode as u64)
    }

    pub fn num(self, value: u64) -> Self {
        self.symbol(SymbolType::Num, value)
    }

    pub fn temp(self, index: u64) -> Self {
        self.symbol(SymbolType::Temp, index)
    }

    pub fn global(self, index: u64) -> Self {
        self.symbol(SymbolType::GlobalId, index)
    }

    pub fn local(self, index: u64) -> Self {
        self.symbol(SymbolType::LocalId, index)
    }

    pub fn register(self, register: u64) -> Self {
        self.symbol(SymbolType::Register, register)
    }

    pub fn pseudo(self, register: PseudoRegister) -> Self {
        self.symbol(SymbolType::PseudoRegister, register as u64)
    }

    pub fn return_value(self) -> Self {
        self.symbol(SymbolType::ReturnValue, 0)
    }

    pub fn locals(self, count: u64) -> Self {
        self.symbol(SymbolType::VariableCount, count)
    }

    fn packed(mut self, symbol_type: SymbolType, bytes: &[u8]) -> Self {
        self.symbols.push(Symbol::new(symbol_type, bytes.len() as u64));
        for chunk in bytes.chunks(SYMBOL_SIZE) {
            let mut slot = [0u8; SYMBOL_SIZE];
            slot[..chunk.len()].copy_from_slice(chunk);
            let low = u64::from_le_bytes([slot[0], slot[1], slot[2], slot[3], slot[4], slot[5], slot[6], slot[7]]);
            let high = u64::from_le_bytes([slot[8], slot[9], slot[10], slot[11], slot[12], slot[13], slot[14], slot[15]]);
            self.symbols.push(Symbol { symbol_type: low.into(), value: high.into() });
        }
        self
    }

    pub fn string(self, text: &str) -> Self {
        self.packed(SymbolType::String, text.as_bytes())
    }

    pub fn wstring(self, text: &str) -> Self {
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        self.packed(SymbolType::WString, &bytes)
    }

    /// `dest = value`.
    pub fn mov(self, value: (SymbolType, u64), dest: (SymbolType, u64)) -> Self {
        self.op(Opcode::Mov).symbol(value.0, value.1).symbol(dest.0, dest.1)
    }

    pub fn build(&self) -> Vec<u8> {
        zerocopy::IntoBytes::as_bytes(self.symbols.as_slice()).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_malformed_blobs() {
        assert_eq!(Script::parse(&[]), Err(ScriptError::MalformedBlob.into()));
        assert_eq!(Script::parse(&[0u8; 17]), Err(ScriptError::MalformedBlob.into()));

        let unknown_type = ScriptBuilder::new().symbol(SymbolType::Num, 1).build();
        let mut corrupted = unknown_type.clone();
        corrupted[0] = 99;
        assert_eq!(Script::parse(&corrupted), Err(ScriptError::InvalidOperand(99).into()));

        // A string whose length runs past the end of the blob.
        let truncated = ScriptBuilder::new().symbol(SymbolType::String, 40).num(0).build();
        assert_eq!(Script::parse(&truncated), Err(ScriptError::MalformedBlob.into()));
    }

    #[test]
    fn test_parse_reads_variable_count() {
        let blob = ScriptBuilder::new().locals(3).op(Opcode::Print).string("hello").build();
        let script = Script::parse(&blob).unwrap();
        assert_eq!(script.local_count(), 3);
        assert_eq!(script.symbols().len(), 4);
    }
}
