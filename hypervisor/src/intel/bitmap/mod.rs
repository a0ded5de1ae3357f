//! MSR and I/O bitmaps.
//!
//! Each logical processor owns one MSR bitmap and one pair of I/O bitmaps. A set bit makes the
//! corresponding access exit; the event engine toggles bits as interceptions are acquired and
//! released.

use {
    crate::error::HypervisorError,
    alloc::boxed::Box,
    zerocopy::FromZeros,
};

/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.9 MSR-Bitmap Address
///
/// Four contiguous 1-KByte bitmaps. An RDMSR or WRMSR exits when RCX is outside both covered
/// ranges or when the bit for RCX is 1.
#[repr(C, align(4096))]
#[derive(FromZeros)]
pub struct MsrBitmap {
    /// RDMSR of 00000000H to 00001FFFH.
    pub read_low_msrs: [u8; 0x400],

    /// RDMSR of C0000000H to C0001FFFH.
    pub read_high_msrs: [u8; 0x400],

    /// WRMSR of 00000000H to 00001FFFH.
    pub write_low_msrs: [u8; 0x400],

    /// WRMSR of C0000000H to C0001FFFH.
    pub write_high_msrs: [u8; 0x400],
}

static_assertions::const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 0x1000);

/// Whether a bitmap entry concerns reads or writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MsrAccess {
    Read,
    Write,
}

impl MsrBitmap {
    pub fn new() -> Result<Box<Self>, HypervisorError> {
        Self::new_box_zeroed().map_err(|_| HypervisorError::OutOfPool)
    }

    /// Whether `msr` is covered by the bitmap at all. MSRs outside both ranges always exit.
    pub fn covers(msr: u32) -> bool {
        msr <= 0x1FFF || (0xC000_0000..=0xC000_1FFF).contains(&msr)
    }

    fn slot(&mut self, msr: u32, access: MsrAccess) -> Option<(&mut u8, u8)> {
        if !Self::covers(msr) {
            return None;
        }

        let msr_low = (msr & 0x1FFF) as usize;
        let table = match (access, msr >= 0xC000_0000) {
            (MsrAccess::Read, false) => &mut self.read_low_msrs,
            (MsrAccess::Read, true) => &mut self.read_high_msrs,
            (MsrAccess::Write, false) => &mut self.write_low_msrs,
            (MsrAccess::Write, true) => &mut self.write_high_msrs,
        };

        Some((&mut table[msr_low / 8], 1 << (msr_low % 8)))
    }

    /// Sets or clears the exit bit of `msr`. MSRs outside the covered ranges are ignored.
    pub fn set(&mut self, msr: u32, access: MsrAccess, intercept: bool) {
        if let Some((byte, bit)) = self.slot(msr, access) {
            if intercept {
                *byte |= bit;
            } else {
                *byte &= !bit;
            }
        }
    }

    /// Sets or clears every bit of one access kind.
    pub fn set_all(&mut self, access: MsrAccess, intercept: bool) {
        let fill = if intercept { 0xFF } else { 0x00 };
        match access {
            MsrAccess::Read => {
                self.read_low_msrs.fill(fill);
                self.read_high_msrs.fill(fill);
            }
            MsrAccess::Write => {
                self.write_low_msrs.fill(fill);
                self.write_high_msrs.fill(fill);
            }
        }
    }

    pub fn intercepts(&mut self, msr: u32, access: MsrAccess) -> bool {
        match self.slot(msr, access) {
            Some((byte, bit)) => *byte & bit != 0,
            None => true,
        }
    }
}

/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.4 I/O-Bitmap Addresses
///
/// Bitmap A covers ports 0000H to 7FFFH, bitmap B ports 8000H to FFFFH.
#[repr(C, align(4096))]
#[derive(FromZeros)]
pub struct IoBitmap {
    pub bitmap_a: [u8; 0x1000],
    pub bitmap_b: [u8; 0x1000],
}

static_assertions::const_assert_eq!(core::mem::size_of::<IoBitmap>(), 0x2000);

impl IoBitmap {
    pub fn new() -> Result<Box<Self>, HypervisorError> {
        Self::new_box_zeroed().map_err(|_| HypervisorError::OutOfPool)
    }

    fn slot(&mut self, port: u16) -> (&mut u8, u8) {
        let index = usize::from(port & 0x7FFF);
        let table = if port < 0x8000 { &mut self.bitmap_a } else { &mut self.bitmap_b };
        (&mut table[index / 8], 1 << (index % 8))
    }

    pub fn set(&mut self, port: u16, intercept: bool) {
        let (byte, bit) = self.slot(port);
        if intercept {
            *byte |= bit;
        } else {
            *byte &= !bit;
        }
    }

    pub fn set_all(&mut self, intercept: bool) {
        let fill = if intercept { 0xFF } else { 0x00 };
        self.bitmap_a.fill(fill);
        self.bitmap_b.fill(fill);
    }

    pub fn intercepts(&mut self, port: u16) -> bool {
        let (byte, bit) = self.slot(port);
        *byte & bit != 0
    }
}
