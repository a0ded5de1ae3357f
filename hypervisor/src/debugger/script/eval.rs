//! The evaluator loop.
//!
//! Operands of multi-argument operations appear last argument first, followed by the
//! destination when the operation produces a value. For `a - b` the blob reads
//! `sub b a dest`.

use {
    super::{format, string_slots, Opcode, PseudoRegister, RegisterId, Script, ScriptHost, ScriptOutput, Symbol, SymbolType, SYMBOL_SIZE},
    crate::{
        debugger::{disassembler, events::ModifyAction},
        error::ScriptError,
    },
    alloc::{vec, vec::Vec},
    core::sync::atomic::{AtomicU64, Ordering},
    zerocopy::IntoBytes,
};

const TEMP_COUNT: usize = 128;
const STACK_SIZE: usize = 256;

/// Longest string or buffer a single operation walks.
pub const MAX_SPAN: usize = 0x1000;

pub struct Evaluator<'a> {
    symbols: &'a [Symbol],
    host: &'a mut dyn ScriptHost,
    ip: usize,
    temps: [u64; TEMP_COUNT],
    locals: Vec<u64>,
    stack: Vec<u64>,
    base: usize,
    frames: usize,
    return_value: u64,
    budget: u64,
    executed: u64,
}

impl<'a> Evaluator<'a> {
    pub fn new(script: &'a Script, host: &'a mut dyn ScriptHost, budget: u64) -> Self {
        Self {
            symbols: script.symbols(),
            host,
            ip: 0,
            temps: [0; TEMP_COUNT],
            locals: vec![0; script.local_count()],
            stack: Vec::new(),
            base: 0,
            frames: 0,
            return_value: 0,
            budget,
            executed: 0,
        }
    }

    pub fn run(mut self) -> Result<ScriptOutput, ScriptError> {
        loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => return Ok(self.output(false)),
                Err(ScriptError::MemoryAccess) => return Ok(self.output(true)),
                Err(error) => return Err(error),
            }
        }
    }

    fn output(&self, memory_access_failed: bool) -> ScriptOutput {
        ScriptOutput { return_value: self.return_value, memory_access_failed, instructions: self.executed }
    }

    fn fetch(&mut self) -> Result<Symbol, ScriptError> {
        let symbol = *self.symbols.get(self.ip).ok_or(ScriptError::MalformedBlob)?;
        self.ip += 1;
        Ok(symbol)
    }

    fn operand(&mut self) -> Result<u64, ScriptError> {
        let symbol = self.fetch()?;
        self.value_of(symbol)
    }

    fn parameter_slot(&self, index: u64) -> Option<usize> {
        self.base.checked_sub(3)?.checked_sub(usize::try_from(index).ok()?)
    }

    fn stack_slot(&self, symbol: Symbol) -> Option<usize> {
        let value = usize::try_from(symbol.value()).ok()?;
        let slot = match symbol.kind()? {
            SymbolType::StackIndex => value,
            SymbolType::StackBaseIndex => self.base.checked_add(value)?,
            SymbolType::FunctionParameterId => self.parameter_slot(symbol.value())?,
            _ => return None,
        };
        (slot < self.stack.len()).then_some(slot)
    }

    fn value_of(&self, symbol: Symbol) -> Result<u64, ScriptError> {
        let invalid = ScriptError::InvalidOperand(symbol.symbol_type.get());
        let value = symbol.value();
        let index = value as usize;

        match symbol.kind().ok_or(invalid)? {
            SymbolType::Num => Ok(value),
            SymbolType::GlobalId => self.host.globals().get(index).map(|global| global.load(Ordering::Acquire)).ok_or(invalid),
            SymbolType::LocalId => self.locals.get(index).copied().ok_or(invalid),
            SymbolType::Temp => self.temps.get(index).copied().ok_or(invalid),
            SymbolType::Register => RegisterId::from_u64(value).map(|register| self.read_register(register)).ok_or(invalid),
            SymbolType::PseudoRegister => PseudoRegister::from_u64(value).map(|register| self.host.pseudo_register(register)).ok_or(invalid),
            SymbolType::StackIndex | SymbolType::StackBaseIndex | SymbolType::FunctionParameterId => {
                self.stack_slot(symbol).map(|slot| self.stack[slot]).ok_or(invalid)
            }
            SymbolType::ReturnValue => Ok(self.return_value),
            _ => Err(invalid),
        }
    }

    fn write(&mut self, symbol: Symbol, value: u64) -> Result<(), ScriptError> {
        let invalid = ScriptError::InvalidOperand(symbol.symbol_type.get());
        let index = symbol.value() as usize;

        match symbol.kind().ok_or(invalid)? {
            SymbolType::GlobalId => self.host.globals().get(index).ok_or(invalid)?.store(value, Ordering::Release),
            SymbolType::LocalId => *self.locals.get_mut(index).ok_or(invalid)? = value,
            SymbolType::Temp => *self.temps.get_mut(index).ok_or(invalid)? = value,
            SymbolType::Register => {
                let register = RegisterId::from_u64(symbol.value()).ok_or(invalid)?;
                self.write_register(register, value);
            }
            SymbolType::StackIndex | SymbolType::StackBaseIndex | SymbolType::FunctionParameterId => {
                let slot = self.stack_slot(symbol).ok_or(invalid)?;
                self.stack[slot] = value;
            }
            SymbolType::ReturnValue => self.return_value = value,
            _ => return Err(invalid),
        }

        Ok(())
    }

    fn store(&mut self, value: u64) -> Result<(), ScriptError> {
        let dest = self.fetch()?;
        self.write(dest, value)
    }

    fn read_register(&self, register: RegisterId) -> u64 {
        match register {
            RegisterId::Gpr32(index) => self.host.register(RegisterId::Gpr64(index)) & 0xFFFF_FFFF,
            RegisterId::Gpr16(index) => self.host.register(RegisterId::Gpr64(index)) & 0xFFFF,
            RegisterId::Gpr8(index) => self.host.register(RegisterId::Gpr64(index)) & 0xFF,
            other => self.host.register(other),
        }
    }

    fn write_register(&mut self, register: RegisterId, value: u64) {
        let merge = |host: &dyn ScriptHost, index: u8, mask: u64| (host.register(RegisterId::Gpr64(index)) & !mask) | (value & mask);

        match register {
            RegisterId::Gpr32(index) => self.host.set_register(RegisterId::Gpr64(index), value & 0xFFFF_FFFF),
            RegisterId::Gpr16(index) => {
                let merged = merge(&*self.host, index, 0xFFFF);
                self.host.set_register(RegisterId::Gpr64(index), merged);
            }
            RegisterId::Gpr8(index) => {
                let merged = merge(&*self.host, index, 0xFF);
                self.host.set_register(RegisterId::Gpr64(index), merged);
            }
            other => self.host.set_register(other, value),
        }
    }

    /// Reads the string symbol at the instruction pointer and skips its slots.
    fn string(&mut self) -> Result<(Vec<u8>, bool), ScriptError> {
        let header = self.fetch()?;
        let wide = match header.kind() {
            Some(SymbolType::String) => false,
            Some(SymbolType::WString) => true,
            _ => return Err(ScriptError::InvalidOperand(header.symbol_type.get())),
        };

        let length = header.value() as usize;
        let slots = string_slots(header.value())?;
        let packed = self.symbols.get(self.ip..self.ip + slots).ok_or(ScriptError::MalformedBlob)?;
        let mut bytes = packed.as_bytes().to_vec();
        bytes.truncate(length.min(slots * SYMBOL_SIZE));
        self.ip += slots;

        Ok((bytes, wide))
    }

    fn jump(&mut self, target: u64) -> Result<(), ScriptError> {
        let target = usize::try_from(target).map_err(|_| ScriptError::MalformedBlob)?;
        if target > self.symbols.len() {
            return Err(ScriptError::MalformedBlob);
        }
        self.ip = target;
        Ok(())
    }

    fn push(&mut self, value: u64) -> Result<(), ScriptError> {
        if self.stack.len() >= STACK_SIZE {
            return Err(ScriptError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, ScriptError> {
        if self.stack.len() <= self.base && self.frames > 0 {
            return Err(ScriptError::StackUnderflow);
        }
        self.stack.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn read(&self, address: u64, buffer: &mut [u8], physical: bool) -> Result<(), ScriptError> {
        if self.host.read_memory(address, buffer, physical) {
            Ok(())
        } else {
            Err(ScriptError::MemoryAccess)
        }
    }

    fn read_sized(&self, address: u64, size: usize, physical: bool) -> Result<u64, ScriptError> {
        let mut buffer = [0u8; 8];
        self.read(address, &mut buffer[..size], physical)?;
        Ok(u64::from_le_bytes(buffer))
    }

    fn write_sized(&mut self, address: u64, value: u64, size: usize, physical: bool) -> Result<(), ScriptError> {
        if self.host.write_memory(address, &value.to_le_bytes()[..size], physical) {
            Ok(())
        } else {
            Err(ScriptError::MemoryAccess)
        }
    }

    /// Reads a NUL-terminated string of `width`-byte units, excluding the terminator.
    fn read_units(&self, address: u64, width: usize, limit: usize) -> Result<Vec<u64>, ScriptError> {
        let mut units = Vec::new();
        while units.len() < limit.min(MAX_SPAN) {
            let unit = self.read_sized(address + (units.len() * width) as u64, width, false)?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        Ok(units)
    }

    fn read_span(&self, address: u64, length: u64) -> Result<Vec<u8>, ScriptError> {
        let length = usize::try_from(length).ok().filter(|length| *length <= MAX_SPAN).ok_or(ScriptError::InvalidOperand(length))?;
        let mut buffer = vec![0u8; length];
        self.read(address, &mut buffer, false)?;
        Ok(buffer)
    }

    /// The atomic behind `address` when it is the reference of a global variable.
    fn global_at(&self, address: u64) -> Option<&AtomicU64> {
        self.host.globals().iter().find(|global| *global as *const AtomicU64 as u64 == address)
    }

    /// Runs `update` on the 64-bit value at `address` and returns the previous value.
    fn atomic_update(&mut self, address: u64, update: impl Fn(u64) -> u64) -> Result<u64, ScriptError> {
        if let Some(global) = self.global_at(address) {
            let result = global.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| Some(update(value)));
            return Ok(result.unwrap_or_else(|value| value));
        }

        let previous = self.read_sized(address, 8, false)?;
        self.write_sized(address, update(previous), 8, false)?;
        Ok(previous)
    }

    fn charge(&mut self) -> Result<(), ScriptError> {
        self.executed += 1;
        if self.executed > self.budget {
            return Err(ScriptError::BudgetExceeded);
        }
        Ok(())
    }

    fn spinlock_lock(&mut self, address: u64, wait: u64) -> Result<(), ScriptError> {
        loop {
            if self.atomic_update(address, |_| 1)? == 0 {
                return Ok(());
            }
            self.charge()?;
            for _ in 0..wait.min(0x10000) {
                core::hint::spin_loop();
            }
        }
    }

    fn disassemble_length(&self, address: u64, bitness: u32) -> u64 {
        let bytes = disassembler::read_instruction_bytes(
            &mut |va, buffer| self.host.read_memory(va, buffer, false),
            address,
        );
        disassembler::instruction_length(&bytes, bitness).unwrap_or(0) as u64
    }

    /// Executes one instruction. Returns false when the script finished.
    fn step(&mut self) -> Result<bool, ScriptError> {
        if self.ip >= self.symbols.len() {
            return Ok(false);
        }

        let symbol = self.fetch()?;
        match symbol.kind() {
            Some(SymbolType::SemanticRule) => {}
            Some(SymbolType::VariableCount) => return Ok(true),
            _ => return Err(ScriptError::InvalidOpcode(symbol.value())),
        }

        self.charge()?;
        let opcode = Opcode::from_u64(symbol.value()).ok_or(ScriptError::InvalidOpcode(symbol.value()))?;
        self.execute(opcode)
    }

    #[rustfmt::skip]
    fn execute(&mut self, opcode: Opcode) -> Result<bool, ScriptError> {
        match opcode {
            Opcode::Or | Opcode::Xor | Opcode::And | Opcode::Asr | Opcode::Asl | Opcode::Add | Opcode::Sub
            | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Gt | Opcode::Lt | Opcode::Egt | Opcode::Elt
            | Opcode::Equal | Opcode::Neq => {
                let src0 = self.operand()?;
                let src1 = self.operand()?;
                let value = binary(opcode, src1, src0)?;
                self.store(value)?;
            }
            Opcode::Not | Opcode::Neg => {
                let value = self.operand()?;
                self.store(if opcode == Opcode::Not { !value } else { value.wrapping_neg() })?;
            }
            Opcode::Inc | Opcode::Dec => {
                let target = self.fetch()?;
                let value = self.value_of(target)?;
                let value = if opcode == Opcode::Inc { value.wrapping_add(1) } else { value.wrapping_sub(1) };
                self.write(target, value)?;
            }
            Opcode::Poi | Opcode::Db | Opcode::Dw | Opcode::Dd | Opcode::Dq | Opcode::Hi | Opcode::Low
            | Opcode::PoiPa | Opcode::DbPa | Opcode::DwPa | Opcode::DdPa | Opcode::DqPa | Opcode::HiPa | Opcode::LowPa => {
                let physical = matches!(opcode, Opcode::PoiPa | Opcode::DbPa | Opcode::DwPa | Opcode::DdPa | Opcode::DqPa | Opcode::HiPa | Opcode::LowPa);
                let address = self.operand()?;
                let value = match opcode {
                    Opcode::Db | Opcode::DbPa => self.read_sized(address, 1, physical)?,
                    Opcode::Dw | Opcode::DwPa => self.read_sized(address, 2, physical)?,
                    Opcode::Dd | Opcode::DdPa => self.read_sized(address, 4, physical)?,
                    Opcode::Hi | Opcode::HiPa => (self.read_sized(address, 8, physical)? >> 16) & 0xFFFF,
                    Opcode::Low | Opcode::LowPa => self.read_sized(address, 8, physical)? & 0xFFFF,
                    _ => self.read_sized(address, 8, physical)?,
                };
                self.store(value)?;
            }
            Opcode::Eb | Opcode::Ed | Opcode::Eq | Opcode::EbPa | Opcode::EdPa | Opcode::EqPa => {
                let value = self.operand()?;
                let address = self.operand()?;
                let (size, physical) = match opcode {
                    Opcode::Eb => (1, false),
                    Opcode::Ed => (4, false),
                    Opcode::Eq => (8, false),
                    Opcode::EbPa => (1, true),
                    Opcode::EdPa => (4, true),
                    _ => (8, true),
                };
                let written = self.host.write_memory(address, &value.to_le_bytes()[..size], physical);
                self.store(u64::from(written))?;
            }
            Opcode::Mov => {
                let value = self.operand()?;
                self.store(value)?;
            }
            Opcode::Jmp => {
                let target = self.operand()?;
                self.jump(target)?;
            }
            Opcode::Jz | Opcode::Jnz => {
                let target = self.operand()?;
                let condition = self.operand()?;
                if (condition == 0) == (opcode == Opcode::Jz) {
                    self.jump(target)?;
                }
            }
            Opcode::Push => {
                let value = self.operand()?;
                self.push(value)?;
            }
            Opcode::Pop => {
                let value = self.pop()?;
                self.store(value)?;
            }
            Opcode::Call => {
                let target = self.operand()?;
                self.push(self.ip as u64)?;
                self.push(self.base as u64)?;
                self.base = self.stack.len();
                self.frames += 1;
                self.jump(target)?;
            }
            Opcode::Ret => {
                if self.frames == 0 {
                    return Ok(false);
                }
                self.stack.truncate(self.base);
                let base = self.stack.pop().ok_or(ScriptError::StackUnderflow)?;
                let return_address = self.stack.pop().ok_or(ScriptError::StackUnderflow)?;
                self.base = base as usize;
                self.frames -= 1;
                self.jump(return_address)?;
            }
            Opcode::Print => {
                let value = self.operand()?;
                self.host.print(&alloc::format!("{:x}", value));
            }
            Opcode::Formats => {
                let value = self.operand()?;
                self.host.print(&format::formats(value));
            }
            Opcode::Printf => {
                let (format, _) = self.string()?;
                let count = self.operand()?;
                if count > 32 {
                    return Err(ScriptError::InvalidOperand(count));
                }
                let mut arguments = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    arguments.push(self.operand()?);
                }
                let message = format::printf(&format, &arguments, &mut |address, wide| {
                    let width = if wide { 2 } else { 1 };
                    self.read_units(address, width, MAX_SPAN)
                })?;
                self.host.print(&message);
            }
            Opcode::EventEnable | Opcode::EventDisable | Opcode::EventClear => {
                let tag = self.operand()?;
                let action = match opcode {
                    Opcode::EventEnable => ModifyAction::Enable,
                    Opcode::EventDisable => ModifyAction::Disable,
                    _ => ModifyAction::Clear,
                };
                if !self.host.modify_event(tag, action) {
                    log::warn!("Script could not modify event {:#x}", tag);
                }
            }
            Opcode::EventSc => {
                let enabled = self.operand()?;
                self.host.set_short_circuit(enabled != 0);
            }
            Opcode::EventInject => {
                let vector = self.operand()?;
                let vector = u8::try_from(vector).map_err(|_| ScriptError::InvalidOperand(vector))?;
                self.host.inject_event(vector, None);
            }
            Opcode::EventInjectErrorCode => {
                let error_code = self.operand()?;
                let vector = self.operand()?;
                let vector = u8::try_from(vector).map_err(|_| ScriptError::InvalidOperand(vector))?;
                self.host.inject_event(vector, Some(error_code as u32));
            }
            Opcode::Pause => self.host.pause(),
            Opcode::Flush => self.host.flush(),
            Opcode::CheckAddress => {
                let address = self.operand()?;
                let valid = self.host.check_address(address, 1);
                self.store(u64::from(valid))?;
            }
            Opcode::Strlen | Opcode::Wcslen => {
                let address = self.operand()?;
                let width = if opcode == Opcode::Strlen { 1 } else { 2 };
                let length = self.read_units(address, width, MAX_SPAN)?.len();
                self.store(length as u64)?;
            }
            Opcode::DisassembleLen | Opcode::DisassembleLen32 | Opcode::DisassembleLen64 => {
                let address = self.operand()?;
                let bitness = match opcode {
                    Opcode::DisassembleLen32 => 32,
                    Opcode::DisassembleLen64 => 64,
                    _ => self.host.code_bitness(),
                };
                let length = self.disassemble_length(address, bitness);
                self.store(length)?;
            }
            Opcode::Rdtsc => {
                let tsc = self.host.rdtsc();
                self.store(tsc)?;
            }
            Opcode::Rdtscp => {
                let (tsc, _) = self.host.rdtscp();
                self.store(tsc)?;
            }
            Opcode::InterlockedIncrement | Opcode::InterlockedDecrement => {
                let address = self.operand()?;
                let delta = if opcode == Opcode::InterlockedIncrement { 1u64 } else { u64::MAX };
                let previous = self.atomic_update(address, |value| value.wrapping_add(delta))?;
                self.store(previous.wrapping_add(delta))?;
            }
            Opcode::InterlockedExchange | Opcode::InterlockedExchangeAdd => {
                let value = self.operand()?;
                let address = self.operand()?;
                let previous = if opcode == Opcode::InterlockedExchange {
                    self.atomic_update(address, |_| value)?
                } else {
                    self.atomic_update(address, |current| current.wrapping_add(value))?
                };
                self.store(previous)?;
            }
            Opcode::InterlockedCompareExchange => {
                let comparand = self.operand()?;
                let exchange = self.operand()?;
                let address = self.operand()?;
                let previous = self.atomic_update(address, |current| if current == comparand { exchange } else { current })?;
                self.store(previous)?;
            }
            Opcode::SpinlockLock => {
                let address = self.operand()?;
                self.spinlock_lock(address, 1)?;
            }
            Opcode::SpinlockLockCustomWait => {
                let wait = self.operand()?;
                let address = self.operand()?;
                self.spinlock_lock(address, wait)?;
            }
            Opcode::SpinlockUnlock => {
                let address = self.operand()?;
                self.atomic_update(address, |_| 0)?;
            }
            Opcode::Memcpy => {
                let length = self.operand()?;
                let source = self.operand()?;
                let destination = self.operand()?;
                let bytes = self.read_span(source, length)?;
                if !self.host.write_memory(destination, &bytes, false) {
                    return Err(ScriptError::MemoryAccess);
                }
            }
            Opcode::Memcmp => {
                let length = self.operand()?;
                let second = self.operand()?;
                let first = self.operand()?;
                let first = self.read_span(first, length)?;
                let second = self.read_span(second, length)?;
                self.store(compare(first.iter().map(|b| u64::from(*b)), second.iter().map(|b| u64::from(*b)), usize::MAX))?;
            }
            Opcode::Strcmp | Opcode::Wcscmp => {
                let second = self.operand()?;
                let first = self.operand()?;
                let width = if opcode == Opcode::Strcmp { 1 } else { 2 };
                let first = self.read_units(first, width, MAX_SPAN)?;
                let second = self.read_units(second, width, MAX_SPAN)?;
                self.store(compare(first.into_iter(), second.into_iter(), usize::MAX))?;
            }
            Opcode::Strncmp => {
                let count = self.operand()?;
                let second = self.operand()?;
                let first = self.operand()?;
                let limit = usize::try_from(count).unwrap_or(MAX_SPAN).min(MAX_SPAN);
                let first = self.read_units(first, 1, limit)?;
                let second = self.read_units(second, 1, limit)?;
                self.store(compare(first.into_iter(), second.into_iter(), limit))?;
            }
            Opcode::VirtualToPhysical => {
                let va = self.operand()?;
                let pa = self.host.virtual_to_physical(va).unwrap_or(0);
                self.store(pa)?;
            }
            Opcode::PhysicalToVirtual => {
                let pa = self.operand()?;
                let va = self.host.physical_to_virtual(pa).unwrap_or(0);
                self.store(va)?;
            }
            Opcode::Reference => {
                let target = self.fetch()?;
                let address = match target.kind() {
                    Some(SymbolType::GlobalId) => self
                        .host
                        .globals()
                        .get(target.value() as usize)
                        .map(|global| global as *const AtomicU64 as u64)
                        .ok_or(ScriptError::InvalidOperand(target.symbol_type.get()))?,
                    _ => return Err(ScriptError::InvalidOperand(target.symbol_type.get())),
                };
                self.store(address)?;
            }
            Opcode::Microsleep => {
                let microseconds = self.operand()?;
                self.host.microsleep(microseconds);
            }
            Opcode::TestStatement => {
                let value = self.operand()?;
                self.host.test_statement(value);
            }
        }

        Ok(true)
    }
}

fn binary(opcode: Opcode, a: u64, b: u64) -> Result<u64, ScriptError> {
    Ok(match opcode {
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::And => a & b,
        Opcode::Asr => u32::try_from(b).ok().and_then(|count| a.checked_shr(count)).unwrap_or(0),
        Opcode::Asl => u32::try_from(b).ok().and_then(|count| a.checked_shl(count)).unwrap_or(0),
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => a.checked_div(b).ok_or(ScriptError::DivisionByZero)?,
        Opcode::Mod => a.checked_rem(b).ok_or(ScriptError::DivisionByZero)?,
        Opcode::Gt => u64::from(a > b),
        Opcode::Lt => u64::from(a < b),
        Opcode::Egt => u64::from(a >= b),
        Opcode::Elt => u64::from(a <= b),
        Opcode::Equal => u64::from(a == b),
        Opcode::Neq => u64::from(a != b),
        other => return Err(ScriptError::InvalidOpcode(other as u64)),
    })
}

/// C-style comparison: 0 when equal, otherwise the difference of the first differing units.
fn compare(first: impl Iterator<Item = u64>, second: impl Iterator<Item = u64>, limit: usize) -> u64 {
    let mut first = first.take(limit);
    let mut second = second.take(limit);
    loop {
        match (first.next(), second.next()) {
            (None, None) => return 0,
            (a, b) => {
                let (a, b) = (a.unwrap_or(0), b.unwrap_or(0));
                if a != b {
                    return a.wrapping_sub(b);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::debugger::script::{ScriptBuilder, GLOBAL_VARIABLE_COUNT},
        alloc::{collections::BTreeMap, string::String},
        proptest::prelude::*,
    };

    /// A host over a flat byte map, for evaluator tests.
    pub(crate) struct TestHost {
        pub registers: [u64; 18],
        pub memory: BTreeMap<u64, u8>,
        pub printed: Vec<String>,
        pub modified: Vec<(u64, ModifyAction)>,
        pub short_circuit: Option<bool>,
        pub injected: Vec<(u8, Option<u32>)>,
        pub paused: usize,
        pub globals: Vec<AtomicU64>,
        pub context: u64,
    }

    impl TestHost {
        pub(crate) fn new() -> Self {
            Self {
                registers: [0; 18],
                memory: BTreeMap::new(),
                printed: Vec::new(),
                modified: Vec::new(),
                short_circuit: None,
                injected: Vec::new(),
                paused: 0,
                globals: (0..GLOBAL_VARIABLE_COUNT).map(|_| AtomicU64::new(0)).collect(),
                context: 0,
            }
        }

        pub(crate) fn poke(&mut self, address: u64, bytes: &[u8]) {
            for (offset, byte) in bytes.iter().enumerate() {
                self.memory.insert(address + offset as u64, *byte);
            }
        }
    }

    impl ScriptHost for TestHost {
        fn register(&self, register: RegisterId) -> u64 {
            match register {
                RegisterId::Gpr64(index) => self.registers[index as usize],
                RegisterId::Rflags => self.registers[16],
                RegisterId::Rip => self.registers[17],
                _ => 0,
            }
        }

        fn set_register(&mut self, register: RegisterId, value: u64) {
            match register {
                RegisterId::Gpr64(index) => self.registers[index as usize] = value,
                RegisterId::Rflags => self.registers[16] = value,
                RegisterId::Rip => self.registers[17] = value,
                _ => {}
            }
        }

        fn pseudo_register(&self, register: PseudoRegister) -> u64 {
            match register {
                PseudoRegister::Context => self.context,
                PseudoRegister::Pid => 4,
                _ => 0,
            }
        }

        fn read_memory(&self, address: u64, buffer: &mut [u8], _physical: bool) -> bool {
            let bytes: Option<Vec<u8>> = (0..buffer.len()).map(|offset| self.memory.get(&(address + offset as u64)).copied()).collect();
            match bytes {
                Some(bytes) => {
                    buffer.copy_from_slice(&bytes);
                    true
                }
                None => false,
            }
        }

        fn write_memory(&mut self, address: u64, data: &[u8], _physical: bool) -> bool {
            if !self.check_address(address, data.len()) {
                return false;
            }
            self.poke(address, data);
            true
        }

        fn check_address(&self, address: u64, size: usize) -> bool {
            size > 0 && (0..size).all(|offset| self.memory.contains_key(&(address + offset as u64)))
        }

        fn virtual_to_physical(&self, va: u64) -> Option<u64> {
            self.check_address(va, 1).then_some(va | 0x8000_0000)
        }

        fn physical_to_virtual(&self, pa: u64) -> Option<u64> {
            Some(pa & !0x8000_0000)
        }

        fn print(&mut self, message: &str) {
            self.printed.push(message.into());
        }

        fn modify_event(&mut self, tag: u64, action: ModifyAction) -> bool {
            self.modified.push((tag, action));
            true
        }

        fn set_short_circuit(&mut self, enabled: bool) {
            self.short_circuit = Some(enabled);
        }

        fn inject_event(&mut self, vector: u8, error_code: Option<u32>) {
            self.injected.push((vector, error_code));
        }

        fn pause(&mut self) {
            self.paused += 1;
        }

        fn flush(&mut self) {}

        fn rdtsc(&self) -> u64 {
            0x1234
        }

        fn rdtscp(&self) -> (u64, u32) {
            (0x1235, 1)
        }

        fn microsleep(&self, _microseconds: u64) {}

        fn globals(&self) -> &[AtomicU64] {
            &self.globals
        }

        fn test_statement(&mut self, value: u64) {
            self.printed.push(alloc::format!("test {}", value));
        }
    }

    fn run(builder: ScriptBuilder, host: &mut TestHost) -> Result<ScriptOutput, ScriptError> {
        let script = Script::parse(&builder.build()).map_err(|_| ScriptError::MalformedBlob)?;
        script.run(host, 1000)
    }

    #[test]
    fn test_subtraction_operand_order() {
        let mut host = TestHost::new();
        // 10 - 3
        let script = ScriptBuilder::new().op(Opcode::Sub).num(3).num(10).return_value();
        assert_eq!(run(script, &mut host).unwrap().return_value, 7);
    }

    #[test]
    fn test_register_views() {
        let mut host = TestHost::new();
        host.registers[0] = 0xFFFF_FFFF_FFFF_FFFF;
        let script = ScriptBuilder::new()
            .mov((SymbolType::Num, 0x12), (SymbolType::Register, 0x40))
            .mov((SymbolType::Register, 0x40), (SymbolType::Temp, 0))
            .mov((SymbolType::Num, 0xAB), (SymbolType::Register, 0x21));
        run(script, &mut host).unwrap();
        assert_eq!(host.registers[0], 0xFFFF_FFFF_FFFF_FF12);
        assert_eq!(host.registers[1], 0xAB);
    }

    #[test]
    fn test_loop_with_conditional_jump() {
        let mut host = TestHost::new();
        // t0 = 0; loop: t0++; t1 = t0 < 5; jnz t1 loop; return t0
        let start = ScriptBuilder::new().mov((SymbolType::Num, 0), (SymbolType::Temp, 0));
        let loop_head = start.position();
        let script = start
            .op(Opcode::Inc)
            .temp(0)
            .op(Opcode::Lt)
            .num(5)
            .temp(0)
            .temp(1)
            .op(Opcode::Jnz)
            .num(loop_head)
            .temp(1)
            .mov((SymbolType::Temp, 0), (SymbolType::ReturnValue, 0));

        assert_eq!(run(script, &mut host).unwrap().return_value, 5);
    }

    #[test]
    fn test_budget_is_enforced() {
        let mut host = TestHost::new();
        let script = ScriptBuilder::new().op(Opcode::Jmp).num(0);
        let blob = script.build();
        let script = Script::parse(&blob).unwrap();
        assert_eq!(script.run(&mut host, 50), Err(ScriptError::BudgetExceeded));
    }

    #[test]
    fn test_failed_dereference_stops_execution() {
        let mut host = TestHost::new();
        host.poke(0x1000, &0xC000_0082u64.to_le_bytes());

        let script = ScriptBuilder::new()
            .op(Opcode::Poi)
            .num(0x1000)
            .temp(0)
            .op(Opcode::Poi)
            .num(0x5000)
            .temp(1)
            .mov((SymbolType::Num, 1), (SymbolType::ReturnValue, 0));

        let output = run(script, &mut host).unwrap();
        assert!(output.memory_access_failed);
        assert_eq!(output.return_value, 0);
        assert_eq!(output.instructions, 2);
    }

    #[test]
    fn test_division_by_zero() {
        let mut host = TestHost::new();
        let script = ScriptBuilder::new().op(Opcode::Div).num(0).num(10).temp(0);
        assert_eq!(run(script, &mut host), Err(ScriptError::DivisionByZero));
    }

    #[test]
    fn test_oversized_shift_counts_clear_the_value() {
        assert_eq!(binary(Opcode::Asr, 0x8000, 4), Ok(0x800));
        assert_eq!(binary(Opcode::Asl, 0x8000, 4), Ok(0x8_0000));
        assert_eq!(binary(Opcode::Asr, 0x8000, 64), Ok(0));
        assert_eq!(binary(Opcode::Asr, 0x8000, (1 << 32) | 1), Ok(0));
        assert_eq!(binary(Opcode::Asl, 1, 1 << 32), Ok(0));

        let mut host = TestHost::new();
        let script = ScriptBuilder::new().op(Opcode::Asr).num((1 << 32) | 1).num(0x8000).return_value();
        assert_eq!(run(script, &mut host).unwrap().return_value, 0);
    }

    #[test]
    fn test_call_and_parameters() {
        let mut host = TestHost::new();
        // push 20; push 22; call add; pop; pop; ... add: rv = p0 + p1; ret
        let prologue = ScriptBuilder::new().op(Opcode::Push).num(20).op(Opcode::Push).num(22).op(Opcode::Call);
        let function = prologue.position() + 6;
        let script = prologue
            .num(function)
            .op(Opcode::Pop)
            .temp(0)
            .op(Opcode::Pop)
            .temp(0)
            .op(Opcode::Ret)
            .op(Opcode::Add)
            .symbol(SymbolType::FunctionParameterId, 0)
            .symbol(SymbolType::FunctionParameterId, 1)
            .return_value()
            .op(Opcode::Ret);

        let output = run(script, &mut host).unwrap();
        assert_eq!(output.return_value, 42);
    }

    #[test]
    fn test_pop_on_empty_stack() {
        let mut host = TestHost::new();
        let script = ScriptBuilder::new().op(Opcode::Pop).temp(0);
        assert_eq!(run(script, &mut host), Err(ScriptError::StackUnderflow));
    }

    #[test]
    fn test_interlocked_on_global_reference() {
        let mut host = TestHost::new();
        let script = ScriptBuilder::new()
            .op(Opcode::Reference)
            .global(3)
            .temp(0)
            .op(Opcode::InterlockedIncrement)
            .temp(0)
            .temp(1)
            .op(Opcode::InterlockedExchangeAdd)
            .num(10)
            .temp(0)
            .temp(2)
            .op(Opcode::InterlockedCompareExchange)
            .num(11)
            .num(100)
            .temp(0)
            .return_value();

        let output = run(script, &mut host).unwrap();
        assert_eq!(output.return_value, 11);
        assert_eq!(host.globals[3].load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_memory_writes_and_strings() {
        let mut host = TestHost::new();
        host.poke(0x2000, b"abc\0xyz\0");
        host.poke(0x3000, &[0; 8]);

        let script = ScriptBuilder::new()
            .op(Opcode::Eb)
            .num(0x41)
            .num(0x3000)
            .temp(0)
            .op(Opcode::Strlen)
            .num(0x2000)
            .temp(1)
            .op(Opcode::Strcmp)
            .num(0x2004)
            .num(0x2000)
            .temp(2)
            .op(Opcode::Eq)
            .num(1)
            .num(0x9000)
            .temp(3)
            .op(Opcode::Add)
            .temp(1)
            .temp(3)
            .return_value();

        let output = run(script, &mut host).unwrap();
        assert_eq!(output.return_value, 3);
        assert_eq!(host.memory[&0x3000], 0x41);
    }

    #[test]
    fn test_event_intrinsics() {
        let mut host = TestHost::new();
        let script = ScriptBuilder::new()
            .op(Opcode::EventDisable)
            .num(0x100_0001)
            .op(Opcode::EventSc)
            .num(1)
            .op(Opcode::EventInjectErrorCode)
            .num(0)
            .num(13)
            .op(Opcode::Pause);

        run(script, &mut host).unwrap();
        assert_eq!(host.modified, [(0x100_0001, ModifyAction::Disable)]);
        assert_eq!(host.short_circuit, Some(true));
        assert_eq!(host.injected, [(13, Some(0))]);
        assert_eq!(host.paused, 1);
    }

    #[test]
    fn test_disassemble_len() {
        let mut host = TestHost::new();
        host.poke(0x4000, &[0x48, 0x89, 0xC8, 0xC3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90]);
        let script = ScriptBuilder::new().op(Opcode::DisassembleLen64).num(0x4000).return_value();
        assert_eq!(run(script, &mut host).unwrap().return_value, 3);
    }

    proptest! {
        #[test]
        fn test_arithmetic_matches_native(a in any::<u64>(), b in 1u64..) {
            for (opcode, expected) in [
                (Opcode::Add, a.wrapping_add(b)),
                (Opcode::Sub, a.wrapping_sub(b)),
                (Opcode::Div, a / b),
                (Opcode::Mod, a % b),
                (Opcode::Xor, a ^ b),
                (Opcode::Gt, u64::from(a > b)),
            ] {
                let mut host = TestHost::new();
                let script = ScriptBuilder::new().op(opcode).num(b).num(a).return_value();
                prop_assert_eq!(run(script, &mut host).unwrap().return_value, expected);
            }
        }
    }
}
