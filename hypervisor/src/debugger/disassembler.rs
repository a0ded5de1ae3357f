//! Instruction decoding on guest memory.

use {
    crate::{memory::mapper, platform::Platform},
    alloc::vec::Vec,
    iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic},
    x86::vmx::vmcs::guest,
};

pub const MAX_INSTRUCTION_LENGTH: usize = 15;

const PAGE_SIZE: u64 = 0x1000;

/// Reads up to 15 bytes at `address`, stopping at the first page that cannot be read.
pub fn read_instruction_bytes(read: &mut dyn FnMut(u64, &mut [u8]) -> bool, address: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_INSTRUCTION_LENGTH);
    let mut cursor = address;

    while bytes.len() < MAX_INSTRUCTION_LENGTH {
        let in_page = (PAGE_SIZE - (cursor & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(MAX_INSTRUCTION_LENGTH - bytes.len());
        let mut buffer = [0u8; MAX_INSTRUCTION_LENGTH];

        if !read(cursor, &mut buffer[..chunk]) {
            break;
        }

        bytes.extend_from_slice(&buffer[..chunk]);
        cursor = cursor.wrapping_add(chunk as u64);
    }

    bytes
}

/// Reads the bytes at `address` in the address space `cr3`.
pub fn guest_instruction_bytes(platform: &dyn Platform, cr3: u64, address: u64) -> Vec<u8> {
    read_instruction_bytes(&mut |va, buffer| mapper::read_virtual(platform, cr3, va, buffer).is_ok(), address)
}

/// Decodes the first instruction of `bytes`, or `None` when it is invalid or truncated.
pub fn decode(bytes: &[u8], bitness: u32, ip: u64) -> Option<Instruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }

    let instruction = decoder.decode();
    (!instruction.is_invalid()).then_some(instruction)
}

pub fn instruction_length(bytes: &[u8], bitness: u32) -> Option<usize> {
    decode(bytes, bitness, 0).map(|instruction| instruction.len())
}

/// Calls of any form, which a step-over executes as a whole.
pub fn is_call(instruction: &Instruction) -> bool {
    matches!(instruction.flow_control(), FlowControl::Call | FlowControl::IndirectCall)
}

pub fn is_return(instruction: &Instruction) -> bool {
    matches!(instruction.mnemonic(), Mnemonic::Ret | Mnemonic::Retf)
}

/// Whether execution never falls through to the next instruction.
pub fn ends_flow(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::Interrupt
    ) && instruction.mnemonic() != Mnemonic::Int3
}

/// Code size of the guest at the time of the exit, from the CS access rights.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
pub fn guest_bitness(platform: &dyn Platform) -> u32 {
    const LONG_MODE: u64 = 1 << 13;
    const DEFAULT_BIG: u64 = 1 << 14;

    let access_rights = platform.vmread(guest::CS_ACCESS_RIGHTS);
    if access_rights & LONG_MODE != 0 {
        64
    } else if access_rights & DEFAULT_BIG != 0 {
        32
    } else {
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_and_ret() {
        let call = decode(&[0xE8, 0x05, 0x00, 0x00, 0x00], 64, 0x1000).unwrap();
        assert!(is_call(&call));
        assert_eq!(call.len(), 5);
        assert_eq!(call.near_branch_target(), 0x100A);

        let ret = decode(&[0xC3], 64, 0).unwrap();
        assert!(is_return(&ret));
        assert!(ends_flow(&ret));
        assert!(decode(&[0xE8, 0x05], 64, 0).is_none());
    }

    #[test]
    fn test_read_stops_at_unreadable_page() {
        let mut reader = |va: u64, buffer: &mut [u8]| {
            if va >= 0x2000 {
                return false;
            }
            buffer.fill(0x90);
            true
        };
        assert_eq!(read_instruction_bytes(&mut reader, 0x1FFA).len(), 6);
        assert_eq!(read_instruction_bytes(&mut reader, 0x1000).len(), 15);
    }
}
