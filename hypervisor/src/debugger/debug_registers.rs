//! Hardware breakpoints through DR0-DR3.
//!
//! The debugger claims individual address slots on the processor it runs on. While any slot is
//! claimed, MOV DR exits and #DB is intercepted: the guest keeps reading and writing its own
//! values, which live in a shadow, and DR7 is composed from the guest's enables for the slots it
//! still owns plus the debugger's.

use {
    crate::{
        debugger::events::resources::ResourceController,
        error::HypervisorError,
        intel::vcpu::Interception,
        platform::Platform,
    },
    x86::vmx::vmcs::guest,
};

pub const SLOT_COUNT: usize = 4;

/// DR6.BS: the #DB was caused by a single step (RFLAGS.TF).
pub const DR6_BS: u64 = 1 << 14;

/// DR6.B0-B3.
pub const DR6_HITS: u64 = 0xF;

/// DR7 bit 10 reads as one.
const DR7_RESERVED_ONE: u64 = 1 << 10;

/// Interceptions held while a slot is claimed.
const INTERCEPTIONS: [Interception; 2] = [Interception::MovDrExiting, Interception::Exception(Some(1))];

/// Condition encoded in the R/W field of DR7.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 18.2.4 Debug Control Register (DR7)
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HardwareBreakpointKind {
    ExecuteFetch = 0b00,
    WriteOnly = 0b01,
    ReadWrite = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HardwareBreakpoint {
    pub address: u64,
    pub kind: HardwareBreakpointKind,
    /// 1, 2, 4 or 8 bytes. Execution breakpoints are always 1.
    pub length: u8,
}

impl HardwareBreakpoint {
    pub fn execute(address: u64) -> Self {
        Self { address, kind: HardwareBreakpointKind::ExecuteFetch, length: 1 }
    }

    fn length_bits(&self) -> Result<u64, HypervisorError> {
        match (self.kind, self.length) {
            (HardwareBreakpointKind::ExecuteFetch, 1) => Ok(0b00),
            (HardwareBreakpointKind::ExecuteFetch, _) => Err(HypervisorError::BadEventDescriptor),
            (_, 1) => Ok(0b00),
            (_, 2) => Ok(0b01),
            (_, 8) => Ok(0b10),
            (_, 4) => Ok(0b11),
            _ => Err(HypervisorError::BadEventDescriptor),
        }
    }
}

/// Debug register state of one processor.
#[derive(Debug, Default)]
pub struct DebugRegisterState {
    slots: [Option<HardwareBreakpoint>; SLOT_COUNT],
    /// DR0-DR3 as the guest last wrote them.
    shadow: [u64; SLOT_COUNT],
    /// DR7 as the guest believes it is.
    guest_dr7: u64,
    shadowing: bool,
}

impl DebugRegisterState {
    pub fn slot(&self, index: usize) -> Option<HardwareBreakpoint> {
        self.slots.get(index).copied().flatten()
    }

    pub fn is_claimed(&self) -> bool {
        self.shadowing
    }

    /// Arms `breakpoint` in `index` on the calling processor.
    ///
    /// # Arguments
    ///
    /// * `platform` - The calling processor's platform.
    /// * `resources` - Where the MOV DR and #DB interceptions are acquired.
    /// * `core` - The calling processor.
    /// * `index` - Debug register 0 to 3.
    /// * `breakpoint` - Address and condition.
    pub fn set(
        &mut self,
        platform: &dyn Platform,
        resources: &ResourceController,
        core: u32,
        index: usize,
        breakpoint: HardwareBreakpoint,
    ) -> Result<(), HypervisorError> {
        if index >= SLOT_COUNT {
            return Err(HypervisorError::BadEventDescriptor);
        }
        breakpoint.length_bits()?;

        if !self.shadowing {
            for interception in INTERCEPTIONS {
                resources.acquire(platform, core, interception)?;
            }
            self.guest_dr7 = platform.vmread(guest::DR7);
            for (slot, value) in self.shadow.iter_mut().enumerate() {
                *value = platform.read_dr(slot as u8);
            }
            self.shadowing = true;
        }

        log::trace!("Processor {}: DR{} = {:#x} ({:?})", core, index, breakpoint.address, breakpoint.kind);
        self.slots[index] = Some(breakpoint);
        platform.write_dr(index as u8, breakpoint.address);
        platform.vmwrite(guest::DR7, self.compose_dr7());
        Ok(())
    }

    /// Releases `index`. The guest's value returns to the register, and the last release gives
    /// DR7 and the interceptions back.
    pub fn clear(&mut self, platform: &dyn Platform, resources: &ResourceController, core: u32, index: usize) {
        if self.slot(index).is_none() {
            return;
        }

        self.slots[index] = None;
        platform.write_dr(index as u8, self.shadow[index]);

        if self.slots.iter().all(Option::is_none) {
            platform.vmwrite(guest::DR7, self.guest_dr7);
            for interception in INTERCEPTIONS {
                resources.release(platform, core, interception);
            }
            self.shadowing = false;
        } else {
            platform.vmwrite(guest::DR7, self.compose_dr7());
        }
    }

    /// The claimed slot reported by `dr6`, if any.
    pub fn hit(&self, dr6: u64) -> Option<usize> {
        (0..SLOT_COUNT).find(|index| dr6 & (1 << index) != 0 && self.slots[*index].is_some())
    }

    /// DR7 with the guest's enables for unclaimed slots and locally enabled claimed slots.
    fn compose_dr7(&self) -> u64 {
        let mut dr7 = self.guest_dr7 | DR7_RESERVED_ONE;

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(breakpoint) = slot else {
                continue;
            };

            let enable_bits = 0b11 << (index * 2);
            let condition_bits = 0b1111 << (16 + index * 4);
            dr7 &= !(enable_bits | condition_bits);

            let length = breakpoint.length_bits().unwrap_or(0);
            dr7 |= 1 << (index * 2);
            dr7 |= (breakpoint.kind as u64 | (length << 2)) << (16 + index * 4);
        }

        dr7
    }

    /// `MOV reg, DRn` as the guest should observe it. `index` is already resolved from DR4/DR5.
    pub fn guest_read(&self, platform: &dyn Platform, index: u8) -> u64 {
        match index {
            0..=3 if self.shadowing => self.shadow[index as usize],
            0..=3 | 6 => platform.read_dr(index),
            _ if self.shadowing => self.guest_dr7,
            _ => platform.vmread(guest::DR7),
        }
    }

    /// `MOV DRn, reg` on behalf of the guest.
    pub fn guest_write(&mut self, platform: &dyn Platform, index: u8, value: u64) {
        match index {
            0..=3 => {
                if self.shadowing {
                    self.shadow[index as usize] = value;
                }
                if self.slot(index as usize).is_none() {
                    platform.write_dr(index, value);
                }
            }
            6 => platform.write_dr(6, value),
            _ if self.shadowing => {
                self.guest_dr7 = value;
                platform.vmwrite(guest::DR7, self.compose_dr7());
            }
            _ => platform.vmwrite(guest::DR7, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_claimed_slot_is_hidden_from_guest() {
        let platform = MockPlatform::new(1);
        let resources = ResourceController::new(1);
        platform.set_vmcs(guest::DR7, 0x400 | 0b1000);
        platform.write_dr(1, 0x7777);

        let mut state = DebugRegisterState::default();
        state.set(&platform, &resources, 0, 0, HardwareBreakpoint::execute(0x1005)).unwrap();

        assert_eq!(platform.debug_register(0), 0x1005);
        assert_eq!(platform.vmcs(guest::DR7), 0x400 | 0b1001);
        assert_eq!(resources.count(0, Interception::MovDrExiting), 1);

        // The guest rewrites DR0 and DR7 but still observes its own values.
        state.guest_write(&platform, 0, 0xAAAA);
        state.guest_write(&platform, 7, 0x400);
        assert_eq!(state.guest_read(&platform, 0), 0xAAAA);
        assert_eq!(state.guest_read(&platform, 7), 0x400);
        assert_eq!(platform.debug_register(0), 0x1005);
        assert_eq!(platform.vmcs(guest::DR7), 0x401);

        state.clear(&platform, &resources, 0, 0);
        assert_eq!(platform.debug_register(0), 0xAAAA);
        assert_eq!(platform.vmcs(guest::DR7), 0x400);
        assert_eq!(resources.count(0, Interception::MovDrExiting), 0);
        assert!(!state.is_claimed());
    }

    #[test]
    fn test_write_breakpoint_encoding_and_hit() {
        let platform = MockPlatform::new(1);
        let resources = ResourceController::new(1);
        let mut state = DebugRegisterState::default();

        let breakpoint = HardwareBreakpoint { address: 0x5000, kind: HardwareBreakpointKind::WriteOnly, length: 4 };
        state.set(&platform, &resources, 0, 2, breakpoint).unwrap();
        assert_eq!(platform.vmcs(guest::DR7) >> 24 & 0xF, 0b1101);

        assert_eq!(state.hit(0b0100), Some(2));
        assert_eq!(state.hit(0b0001), None);

        let bad = HardwareBreakpoint { address: 0, kind: HardwareBreakpointKind::ExecuteFetch, length: 2 };
        assert_eq!(state.set(&platform, &resources, 0, 1, bad), Err(HypervisorError::BadEventDescriptor));
        assert_eq!(state.set(&platform, &resources, 0, 4, breakpoint), Err(HypervisorError::BadEventDescriptor));
    }
}
