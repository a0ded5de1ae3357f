//! Walks a guest stack word by word.
//!
//! No unwind information is used. Every slot is reported together with what the mapper knows
//! about the address it holds, and for executable targets the bytes just before it, so that the
//! debugger can show which slots look like return addresses.

use {
    crate::{
        debugger::disassembler,
        error::HypervisorError,
        memory::mapper,
        platform::Platform,
    },
    alloc::vec::Vec,
};

/// Bytes read before a return target. The longest near `call` encoding fits.
pub const CALL_SITE_BYTES: usize = 7;

/// Upper bound on the slots of one walk.
pub const MAX_FRAMES: usize = 0x400;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallstackFrame {
    pub stack_address: u64,
    pub is_stack_address_valid: bool,
    pub value: u64,
    pub is_valid_address: bool,
    pub is_executable: bool,
    /// The bytes preceding `value`, when `value` is executable.
    pub call_site: Option<[u8; CALL_SITE_BYTES]>,
}

impl CallstackFrame {
    /// Whether a `call` ends exactly at `value`, which makes the slot a likely return address.
    pub fn is_return_address(&self, is_32bit: bool) -> bool {
        let Some(bytes) = self.call_site else {
            return false;
        };
        let bitness = if is_32bit { 32 } else { 64 };

        (2..=CALL_SITE_BYTES).any(|len| {
            let start = CALL_SITE_BYTES - len;
            let ip = self.value.wrapping_sub(len as u64);
            disassembler::decode(&bytes[start..], bitness, ip)
                .is_some_and(|instruction| disassembler::is_call(&instruction) && instruction.len() == len)
        })
    }
}

/// Reads `size` bytes of stack at `base` as 4 or 8 byte slots.
///
/// # Arguments
///
/// * `platform` - The processor the debugger runs on.
/// * `cr3` - Address space of the stack.
/// * `base` - Lowest stack address to read, usually RSP.
/// * `size` - Number of bytes to walk.
/// * `is_32bit` - Whether slots are 32-bit.
///
/// # Returns
///
/// One frame per slot, or an error when not even the first slot is mapped.
pub fn walk(platform: &dyn Platform, cr3: u64, base: u64, size: u32, is_32bit: bool) -> Result<Vec<CallstackFrame>, HypervisorError> {
    let word = if is_32bit { 4 } else { 8 };

    if !mapper::check_access(platform, cr3, base, word) {
        log::debug!("Stack at {:#x} is not mapped", base);
        return Err(HypervisorError::MemoryAccessFaulted);
    }

    let count = (size as usize / word).min(MAX_FRAMES);
    let mut frames = Vec::with_capacity(count);

    for index in 0..count {
        let stack_address = base.wrapping_add((index * word) as u64);
        let mut frame = CallstackFrame { stack_address, ..Default::default() };

        let mut slot = [0u8; 8];
        if mapper::read_virtual(platform, cr3, stack_address, &mut slot[..word]).is_ok() {
            frame.is_stack_address_valid = true;
            frame.value = u64::from_le_bytes(slot);
        }

        if frame.is_stack_address_valid && frame.value != 0 {
            frame.is_valid_address = mapper::check_access(platform, cr3, frame.value, 1);
            frame.is_executable = frame.is_valid_address && mapper::is_executable(platform, cr3, frame.value);
        }

        if frame.is_executable {
            let mut call_site = [0u8; CALL_SITE_BYTES];
            let start = frame.value.wrapping_sub(CALL_SITE_BYTES as u64);
            if mapper::read_virtual(platform, cr3, start, &mut call_site).is_ok() {
                frame.call_site = Some(call_site);
            }
        }

        frames.push(frame);
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_walk_marks_return_addresses() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();

        // call rel32 at 0x4000 returns to 0x4005.
        let mut code = [0x90u8; 0x10];
        code[..5].copy_from_slice(&[0xE8, 0x10, 0x00, 0x00, 0x00]);
        platform.map_bytes(cr3, 0x4000, &code);

        let mut stack = Vec::new();
        stack.extend_from_slice(&0x4005u64.to_le_bytes());
        stack.extend_from_slice(&0xDEAD_0000u64.to_le_bytes());
        stack.extend_from_slice(&0x4008u64.to_le_bytes());
        platform.map_bytes(cr3, 0x8000, &stack);

        let frames = walk(&platform, cr3, 0x8000, 24, false).unwrap();
        assert_eq!(frames.len(), 3);

        assert!(frames[0].is_executable);
        assert!(frames[0].is_return_address(false));

        assert_eq!(frames[1].value, 0xDEAD_0000);
        assert!(!frames[1].is_valid_address);
        assert_eq!(frames[1].call_site, None);

        assert!(frames[2].is_executable);
        assert!(!frames[2].is_return_address(false));
    }

    #[test]
    fn test_32bit_slots() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        platform.map_bytes(cr3, 0x8000, &[0x78, 0x56, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);

        let frames = walk(&platform, cr3, 0x8000, 8, true).unwrap();
        assert_eq!(frames.iter().map(|frame| frame.value).collect::<Vec<_>>(), [0x1234_5678, 0xDEAD_BEEF]);
    }

    #[test]
    fn test_unmapped_stack_fails() {
        let platform = MockPlatform::new(1);
        let cr3 = platform.create_address_space();
        assert_eq!(walk(&platform, cr3, 0x8000, 64, false), Err(HypervisorError::MemoryAccessFaulted));
    }
}
