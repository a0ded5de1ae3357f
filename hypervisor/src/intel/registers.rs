//! The guest register save area shared with the VM-exit assembly stub.

/// Guest general-purpose and XMM registers captured on VM exit.
///
/// `rip`, `rsp` and `rflags` live in the VMCS; the dispatcher copies them in at the start of an
/// exit and writes them back before resuming. The field offsets are hard-coded in the
/// `vmlaunch` assembly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub xmm: [u128; 16],
}

static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, rax), 0x0);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, rbp), 0x30);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x70);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, rip), 0x78);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, rflags), 0x88);
static_assertions::const_assert_eq!(core::mem::offset_of!(GuestRegisters, xmm), 0x90);

impl GuestRegisters {
    /// Reads a general-purpose register by its instruction encoding (0 = RAX, 1 = RCX, ...,
    /// 4 = RSP, 15 = R15).
    pub fn gpr(&self, index: u8) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a general-purpose register by its instruction encoding.
    pub fn set_gpr(&mut self, index: u8, value: u64) {
        let slot = match index & 0xF {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *slot = value;
    }

    /// EDX:EAX as a 64-bit value.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx << 32) | (self.rax & 0xFFFF_FFFF)
    }

    /// Splits `value` into EDX:EAX, clearing the upper halves as a 32-bit write does.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xFFFF_FFFF;
        self.rdx = value >> 32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding_order() {
        let mut registers = GuestRegisters::default();
        registers.set_gpr(1, 0x11);
        registers.set_gpr(4, 0x44);
        registers.set_gpr(7, 0x77);

        assert_eq!(registers.rcx, 0x11);
        assert_eq!(registers.rsp, 0x44);
        assert_eq!(registers.rdi, 0x77);
        assert_eq!(registers.gpr(7), 0x77);
    }

    #[test]
    fn test_edx_eax() {
        let mut registers = GuestRegisters { rax: 0xFFFF_FFFF_0000_0001, ..Default::default() };
        registers.set_edx_eax(0x1234_5678_9ABC_DEF0);
        assert_eq!(registers.rax, 0x9ABC_DEF0);
        assert_eq!(registers.rdx, 0x1234_5678);
        assert_eq!(registers.edx_eax(), 0x1234_5678_9ABC_DEF0);
    }
}
