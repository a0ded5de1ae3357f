//! Framing of the kernel debugger wire protocol.
//!
//! A frame is a [`PacketHeader`], the payload and the end marker `00 00 FF FF`. The checksum in
//! the header is the byte sum of the payload. Channels that cannot carry the marker inside a
//! payload send the header and payload base64 encoded; the marker itself always travels raw.

use {
    crate::error::HypervisorError,
    alloc::vec::Vec,
    base64::{engine::general_purpose::STANDARD, Engine},
    zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout},
};

pub const PACKET_MAGIC: [u8; 4] = [0x22, 0x33, 0x44, 0x55];

pub const END_OF_BUFFER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Largest header plus payload accepted from the wire.
pub const MAX_PACKET_SIZE: usize = 0x10000;

/// Consecutive checksum failures after which the link counts as down.
pub const MAX_CHECKSUM_FAILURES: u32 = 3;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: [u8; 4],
    pub packet_type: u8,
    pub requested_action: u32,
    pub checksum: u8,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<PacketHeader>();

static_assertions::const_assert_eq!(HEADER_SIZE, 10);

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketType {
    DebuggerToDebuggee = 1,
    DebuggeeToDebugger = 2,
    DebuggeeToDebuggerHardwareLevel = 3,
    DebuggeeCrash = 4,
    User = 5,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self, HypervisorError> {
        Ok(match value {
            1 => PacketType::DebuggerToDebuggee,
            2 => PacketType::DebuggeeToDebugger,
            3 => PacketType::DebuggeeToDebuggerHardwareLevel,
            4 => PacketType::DebuggeeCrash,
            5 => PacketType::User,
            _ => return Err(HypervisorError::ProtocolMismatch),
        })
    }
}

macro_rules! requested_actions {
    ($($(#[$meta:meta])* $name:ident = $value:literal,)*) => {
        /// What a packet asks for or answers.
        #[repr(u32)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum RequestedAction {
            $($(#[$meta])* $name = $value,)*
        }

        impl RequestedAction {
            pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
                match value {
                    $($value => Ok(RequestedAction::$name),)*
                    _ => Err(HypervisorError::ProtocolMismatch),
                }
            }
        }
    };
}

requested_actions! {
    NoAction = 0,

    // Debugger to debuggee.
    Pause = 0x1,
    Continue = 0x2,
    Step = 0x3,
    CloseAndUnload = 0x4,
    ChangeCore = 0x5,
    ChangeProcess = 0x6,
    ChangeThread = 0x7,
    ReadRegisters = 0x8,
    WriteRegister = 0x9,
    ReadMemory = 0xA,
    EditMemory = 0xB,
    SearchMemory = 0xC,
    Va2PaPa2Va = 0xD,
    QueryPte = 0xE,
    RunScript = 0xF,
    RegisterEvent = 0x10,
    AddActionToEvent = 0x11,
    QueryAndModifyEvent = 0x12,
    SetShortCircuitingState = 0x13,
    Bp = 0x14,
    ListOrModifyBreakpoints = 0x15,
    Callstack = 0x16,
    TestQuery = 0x17,
    InjectPageFault = 0x18,
    SymbolReload = 0x19,
    UserInputBuffer = 0x1A,
    FlushBuffers = 0x1B,
    QueryVersion = 0x1C,

    // Debuggee to debugger.
    Started = 0x100,
    /// The halt report: per-core registers and the bytes at RIP.
    Paused = 0x101,
    LoggingMechanism = 0x102,
    ResultOfStep = 0x103,
    ResultOfChangingCore = 0x105,
    ResultOfChangingProcess = 0x106,
    ResultOfChangingThread = 0x107,
    ResultOfReadingRegisters = 0x108,
    ResultOfWritingRegister = 0x109,
    ResultOfReadingMemory = 0x10A,
    ResultOfEditingMemory = 0x10B,
    ResultOfSearch = 0x10C,
    ResultOfVa2PaPa2Va = 0x10D,
    ResultOfPte = 0x10E,
    ResultOfRunningScript = 0x10F,
    ResultOfRegisteringEvent = 0x110,
    ResultOfAddingActionToEvent = 0x111,
    ResultOfQueryAndModifyEvent = 0x112,
    ResultOfShortCircuitingState = 0x113,
    ResultOfBp = 0x114,
    ResultOfListOrModifyBreakpoints = 0x115,
    ResultOfCallstack = 0x116,
    ResultOfTestQuery = 0x117,
    ResultOfInjectPageFault = 0x118,
    ResultOfSymbolReload = 0x119,
    ResultOfUserInputBuffer = 0x11A,
    ResultOfFlush = 0x11B,
    ResultOfQueryVersion = 0x11C,
    /// Sent instead of a result when a request could not be decoded.
    ResultOfUnknownRequest = 0x1FF,
}

impl RequestedAction {
    /// The reply that answers this request.
    pub fn result(self) -> RequestedAction {
        let value = self as u32;
        match value {
            0x3..=0x1C if value != 0x4 => RequestedAction::from_u32(value | 0x100).unwrap_or(RequestedAction::ResultOfUnknownRequest),
            _ => RequestedAction::ResultOfUnknownRequest,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub action: RequestedAction,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, action: RequestedAction, payload: Vec<u8>) -> Self {
        Self { packet_type, action, payload }
    }

    /// Encodes the frame, ready for the wire.
    pub fn encode(&self, base64: bool) -> Vec<u8> {
        let header = PacketHeader {
            magic: PACKET_MAGIC,
            packet_type: self.packet_type as u8,
            requested_action: self.action as u32,
            checksum: checksum(&self.payload),
        };

        let mut body = Vec::with_capacity(HEADER_SIZE + self.payload.len() + END_OF_BUFFER.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&self.payload);

        let mut frame = match base64 {
            true => STANDARD.encode(&body).into_bytes(),
            false => body,
        };
        frame.extend_from_slice(&END_OF_BUFFER);
        frame
    }

    /// Decodes a frame without its end marker. Raw and base64 frames are both accepted.
    pub fn decode(frame: &[u8]) -> Result<Self, HypervisorError> {
        let decoded;
        let body = match frame.starts_with(&PACKET_MAGIC) {
            true => frame,
            false => {
                decoded = STANDARD.decode(frame).map_err(|_| HypervisorError::ProtocolMismatch)?;
                decoded.as_slice()
            }
        };

        let (header, payload) = PacketHeader::read_from_prefix(body).map_err(|_| HypervisorError::ProtocolMismatch)?;
        if header.magic != PACKET_MAGIC {
            return Err(HypervisorError::ProtocolMismatch);
        }

        if checksum(payload) != header.checksum {
            return Err(HypervisorError::LinkDown);
        }

        Ok(Self {
            packet_type: PacketType::from_u8(header.packet_type)?,
            action: RequestedAction::from_u32(header.requested_action)?,
            payload: payload.to_vec(),
        })
    }
}

/// Byte sum modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Decodes frames from a byte stream.
///
/// Bytes accumulate until the end marker. A frame with a bad checksum is dropped and counted;
/// the [`MAX_CHECKSUM_FAILURES`]th failure in a row reports [`HypervisorError::LinkDown`]. Any
/// other malformed frame reports [`HypervisorError::ProtocolMismatch`].
#[derive(Debug, Default)]
pub struct PacketReader {
    buffer: Vec<u8>,
    checksum_failures: u32,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one byte. Returns a result once a whole frame arrived.
    pub fn push(&mut self, byte: u8) -> Option<Result<Packet, HypervisorError>> {
        self.buffer.push(byte);

        if !self.buffer.ends_with(&END_OF_BUFFER) {
            if self.buffer.len() > MAX_PACKET_SIZE * 2 {
                log::warn!("Dropping {} bytes without an end marker", self.buffer.len());
                self.buffer.clear();
                return Some(Err(HypervisorError::ProtocolMismatch));
            }
            return None;
        }

        let frame_len = self.buffer.len() - END_OF_BUFFER.len();
        let result = Packet::decode(&self.buffer[..frame_len]);
        self.buffer.clear();

        Some(match result {
            Ok(packet) => {
                self.checksum_failures = 0;
                Ok(packet)
            }
            Err(HypervisorError::LinkDown) => {
                self.checksum_failures += 1;
                log::warn!("Checksum mismatch ({} in a row)", self.checksum_failures);
                match self.checksum_failures >= MAX_CHECKSUM_FAILURES {
                    true => Err(HypervisorError::LinkDown),
                    false => Err(HypervisorError::ProtocolMismatch),
                }
            }
            Err(error) => Err(error),
        })
    }

    /// Consumes `bytes` and returns every frame they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Packet, HypervisorError>> {
        bytes.iter().filter_map(|byte| self.push(*byte)).collect()
    }

    pub fn checksum_failures(&self) -> u32 {
        self.checksum_failures
    }

    /// Whether part of a frame is buffered.
    pub fn is_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec, proptest::prelude::*};

    #[test]
    fn test_pause_frame_layout() {
        let frame = Packet::new(PacketType::DebuggerToDebuggee, RequestedAction::Pause, vec![]).encode(false);
        assert_eq!(frame, [0x22, 0x33, 0x44, 0x55, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_checksum_covers_payload() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        let frame = Packet::new(PacketType::DebuggeeToDebugger, RequestedAction::Paused, vec![0x80, 0x80, 0x05]).encode(false);
        assert_eq!(frame[9], 0x05);
    }

    #[test]
    fn test_three_bad_checksums_take_the_link_down() {
        let mut frame = Packet::new(PacketType::DebuggerToDebuggee, RequestedAction::ReadMemory, vec![1, 2, 3]).encode(false);
        frame[9] ^= 0xFF;

        let mut reader = PacketReader::new();
        let mut results = Vec::new();
        for _ in 0..3 {
            results.extend(reader.feed(&frame));
        }
        assert_eq!(
            results,
            [Err(HypervisorError::ProtocolMismatch), Err(HypervisorError::ProtocolMismatch), Err(HypervisorError::LinkDown)]
        );

        let good = Packet::new(PacketType::DebuggerToDebuggee, RequestedAction::Continue, vec![]);
        assert_eq!(reader.feed(&good.encode(false)), [Ok(good)]);
        assert_eq!(reader.checksum_failures(), 0);
    }

    #[test]
    fn test_unknown_action_and_garbage() {
        let mut frame = Packet::new(PacketType::DebuggerToDebuggee, RequestedAction::Pause, vec![]).encode(false);
        frame[5] = 0x77;
        assert_eq!(PacketReader::new().feed(&frame), [Err(HypervisorError::ProtocolMismatch)]);
        assert_eq!(PacketReader::new().feed(b"hello\x00\x00\xFF\xFF"), [Err(HypervisorError::ProtocolMismatch)]);
    }

    #[test]
    fn test_base64_frame_survives_marker_in_payload() {
        let packet = Packet::new(PacketType::DebuggeeToDebugger, RequestedAction::ResultOfReadingMemory, vec![0, 0, 0xFF, 0xFF, 7]);
        let frame = packet.encode(true);
        assert!(!frame[..frame.len() - 4].windows(4).any(|window| window == END_OF_BUFFER));
        assert_eq!(PacketReader::new().feed(&frame), [Ok(packet)]);
    }

    #[test]
    fn test_result_actions() {
        assert_eq!(RequestedAction::ReadMemory.result(), RequestedAction::ResultOfReadingMemory);
        assert_eq!(RequestedAction::QueryVersion.result(), RequestedAction::ResultOfQueryVersion);
        assert_eq!(RequestedAction::Pause.result(), RequestedAction::ResultOfUnknownRequest);
    }

    fn arbitrary_action() -> impl Strategy<Value = RequestedAction> {
        (0u32..0x200).prop_filter_map("defined action", |value| RequestedAction::from_u32(value).ok())
    }

    proptest! {
        #[test]
        fn prop_frames_round_trip(action in arbitrary_action(), payload in proptest::collection::vec(any::<u8>(), 0..512), base64 in any::<bool>()) {
            // A raw payload cannot contain the end marker.
            prop_assume!(base64 || !payload.windows(4).any(|window| window == END_OF_BUFFER));

            let packet = Packet::new(PacketType::DebuggerToDebuggee, action, payload);
            let mut reader = PacketReader::new();
            prop_assert_eq!(reader.feed(&packet.encode(base64)), vec![Ok(packet)]);
            prop_assert!(!reader.is_partial());
        }

        #[test]
        fn prop_checksum_is_additive(a in proptest::collection::vec(any::<u8>(), 0..64), b in proptest::collection::vec(any::<u8>(), 0..64)) {
            let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
            prop_assert_eq!(checksum(&joined), checksum(&a).wrapping_add(checksum(&b)));
        }
    }
}
