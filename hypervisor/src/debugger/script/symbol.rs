//! Wire layout of compiled scripts.
//!
//! A script is an array of 16-byte symbols. Instructions start with a `SemanticRule` symbol whose
//! value is the opcode, followed by the operand symbols the opcode consumes. Strings occupy one
//! `String`/`WString` symbol holding the byte length, followed by the bytes packed into as many
//! 16-byte slots as needed.

use zerocopy::{
    little_endian::U64,
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const SYMBOL_SIZE: usize = core::mem::size_of::<Symbol>();

#[repr(C, packed)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Symbol {
    pub symbol_type: U64,
    pub value: U64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Symbol>(), 16);

impl Symbol {
    pub fn new(symbol_type: SymbolType, value: u64) -> Self {
        Self { symbol_type: U64::new(symbol_type as u64), value: U64::new(value) }
    }

    pub fn kind(&self) -> Option<SymbolType> {
        SymbolType::from_u64(self.symbol_type.get())
    }

    pub fn value(&self) -> u64 {
        self.value.get()
    }
}

#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SymbolType {
    Undefined = 0,
    GlobalId = 1,
    LocalId = 2,
    Num = 3,
    Register = 4,
    PseudoRegister = 5,
    SemanticRule = 6,
    Temp = 7,
    String = 8,
    VariableCount = 9,
    InvalidSymbol = 10,
    WString = 11,
    FunctionParameterId = 12,
    ReturnAddress = 13,
    FunctionParameter = 14,
    StackIndex = 15,
    StackBaseIndex = 16,
    ReturnValue = 17,
}

impl SymbolType {
    pub fn from_u64(value: u64) -> Option<Self> {
        use SymbolType::*;
        Some(match value {
            0 => Undefined,
            1 => GlobalId,
            2 => LocalId,
            3 => Num,
            4 => Register,
            5 => PseudoRegister,
            6 => SemanticRule,
            7 => Temp,
            8 => String,
            9 => VariableCount,
            10 => InvalidSymbol,
            11 => WString,
            12 => FunctionParameterId,
            13 => ReturnAddress,
            14 => FunctionParameter,
            15 => StackIndex,
            16 => StackBaseIndex,
            17 => ReturnValue,
            _ => return None,
        })
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:literal,)*) => {
        /// Operations of the evaluator. Binary operators take `src0 src1 dest` and compute
        /// `dest = src1 op src0`.
        #[repr(u64)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            pub fn from_u64(value: u64) -> Option<Self> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    Or = 0,
    Xor = 1,
    And = 2,
    Asr = 3,
    Asl = 4,
    Add = 5,
    Sub = 6,
    Mul = 7,
    Div = 8,
    Mod = 9,
    Gt = 10,
    Lt = 11,
    Egt = 12,
    Elt = 13,
    Equal = 14,
    Neq = 15,
    Not = 16,
    Neg = 17,
    Inc = 18,
    Dec = 19,
    Poi = 20,
    Db = 21,
    Dw = 22,
    Dd = 23,
    Dq = 24,
    Hi = 25,
    Low = 26,
    PoiPa = 27,
    DbPa = 28,
    DwPa = 29,
    DdPa = 30,
    DqPa = 31,
    HiPa = 32,
    LowPa = 33,
    Eb = 34,
    Ed = 35,
    Eq = 36,
    EbPa = 37,
    EdPa = 38,
    EqPa = 39,
    Mov = 40,
    Jz = 41,
    Jnz = 42,
    Jmp = 43,
    Push = 44,
    Pop = 45,
    Call = 46,
    Ret = 47,
    Print = 48,
    Printf = 49,
    Formats = 50,
    EventEnable = 51,
    EventDisable = 52,
    EventClear = 53,
    EventSc = 54,
    EventInject = 55,
    EventInjectErrorCode = 56,
    Pause = 57,
    Flush = 58,
    CheckAddress = 59,
    Strlen = 60,
    Wcslen = 61,
    DisassembleLen = 62,
    DisassembleLen32 = 63,
    DisassembleLen64 = 64,
    Rdtsc = 65,
    Rdtscp = 66,
    InterlockedIncrement = 67,
    InterlockedDecrement = 68,
    InterlockedExchange = 69,
    InterlockedExchangeAdd = 70,
    InterlockedCompareExchange = 71,
    SpinlockLock = 72,
    SpinlockUnlock = 73,
    SpinlockLockCustomWait = 74,
    Memcpy = 75,
    Memcmp = 76,
    Strcmp = 77,
    Strncmp = 78,
    Wcscmp = 79,
    VirtualToPhysical = 80,
    PhysicalToVirtual = 81,
    Reference = 82,
    Microsleep = 83,
    TestStatement = 84,
}

/// Values that describe the exit rather than a guest register.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PseudoRegister {
    Tid = 0,
    Pid = 1,
    Pname = 2,
    Core = 3,
    Proc = 4,
    Thread = 5,
    Peb = 6,
    Teb = 7,
    Ip = 8,
    Buffer = 9,
    Context = 10,
    EventTag = 11,
    EventId = 12,
    EventStage = 13,
    Time = 14,
    Date = 15,
}

impl PseudoRegister {
    pub fn from_u64(value: u64) -> Option<Self> {
        use PseudoRegister::*;
        Some(match value {
            0 => Tid,
            1 => Pid,
            2 => Pname,
            3 => Core,
            4 => Proc,
            5 => Thread,
            6 => Peb,
            7 => Teb,
            8 => Ip,
            9 => Buffer,
            10 => Context,
            11 => EventTag,
            12 => EventId,
            13 => EventStage,
            14 => Time,
            15 => Date,
            _ => return None,
        })
    }
}

/// Register operands.
///
/// 0..=15 are the 64-bit general-purpose registers in instruction encoding order; the narrower
/// views add `0x20` (32-bit), `0x30` (16-bit) and `0x40` (low 8-bit) to the same index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterId {
    Gpr64(u8),
    Gpr32(u8),
    Gpr16(u8),
    Gpr8(u8),
    Rflags,
    Rip,
    Dr(u8),
    Cr(u8),
}

pub const REGISTER_RFLAGS: u64 = 0x10;
pub const REGISTER_RIP: u64 = 0x11;
pub const REGISTER_DR_BASE: u64 = 0x50;
pub const REGISTER_CR_BASE: u64 = 0x60;

impl RegisterId {
    pub fn from_u64(value: u64) -> Option<Self> {
        let index = (value & 0xF) as u8;
        Some(match value {
            0x00..=0x0F => RegisterId::Gpr64(index),
            REGISTER_RFLAGS => RegisterId::Rflags,
            REGISTER_RIP => RegisterId::Rip,
            0x20..=0x2F => RegisterId::Gpr32(index),
            0x30..=0x3F => RegisterId::Gpr16(index),
            0x40..=0x4F => RegisterId::Gpr8(index),
            0x50..=0x57 if !matches!(index, 4 | 5) => RegisterId::Dr(index),
            0x60 | 0x62 | 0x63 | 0x64 | 0x68 => RegisterId::Cr(index),
            _ => return None,
        })
    }
}
