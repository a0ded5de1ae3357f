//! [`ScriptHost`] over the state of a live VM exit.

use {
    super::{PseudoRegister, RegisterId, ScriptHost},
    crate::{
        debugger::{
            disassembler,
            events::{self, EventStage, ModifyAction, TAG_SEED},
            session::{self, PausingReason},
        },
        intel::{
            events::{EventInjection, InterruptionType},
            vmexit::VmExitContext,
        },
        memory::{mapper, pool::PoolBlock},
    },
    core::sync::atomic::AtomicU64,
    x86::vmx::vmcs::guest,
};

/// Days between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE_DAYS: i64 = 134_774;

const TICKS_PER_SECOND: u64 = 10_000_000;

pub struct ExitScriptHost<'c, 'a> {
    ctx: &'c mut VmExitContext<'a>,
    tag: u64,
    stage: EventStage,
    context: u64,
    buffer: Option<PoolBlock>,
    immediate: bool,
    cr3: u64,
    /// Set when the script called `event_sc`.
    pub short_circuit: Option<bool>,
}

impl<'c, 'a> ExitScriptHost<'c, 'a> {
    pub fn new(
        ctx: &'c mut VmExitContext<'a>,
        tag: u64,
        stage: EventStage,
        context: u64,
        buffer: Option<PoolBlock>,
        immediate: bool,
    ) -> Self {
        let cr3 = mapper::guest_cr3(ctx.platform);
        Self { ctx, tag, stage, context, buffer, immediate, cr3, short_circuit: None }
    }
}

impl ScriptHost for ExitScriptHost<'_, '_> {
    fn register(&self, register: RegisterId) -> u64 {
        let platform = self.ctx.platform;
        match register {
            RegisterId::Gpr64(index) | RegisterId::Gpr32(index) | RegisterId::Gpr16(index) | RegisterId::Gpr8(index) => {
                self.ctx.registers.gpr(index)
            }
            RegisterId::Rflags => self.ctx.registers.rflags,
            RegisterId::Rip => self.ctx.registers.rip,
            RegisterId::Dr(7) => platform.vmread(guest::DR7),
            RegisterId::Dr(index) => platform.read_dr(index),
            RegisterId::Cr(0) => platform.vmread(guest::CR0),
            RegisterId::Cr(3) => platform.vmread(guest::CR3),
            RegisterId::Cr(4) => platform.vmread(guest::CR4),
            RegisterId::Cr(index) => platform.read_cr(index),
        }
    }

    fn set_register(&mut self, register: RegisterId, value: u64) {
        let platform = self.ctx.platform;
        match register {
            RegisterId::Gpr64(index) | RegisterId::Gpr32(index) | RegisterId::Gpr16(index) | RegisterId::Gpr8(index) => {
                self.ctx.registers.set_gpr(index, value)
            }
            RegisterId::Rflags => self.ctx.registers.rflags = value,
            RegisterId::Rip => {
                self.ctx.registers.rip = value;
                self.ctx.vcpu.suppress_rip_increment();
            }
            RegisterId::Dr(7) => platform.vmwrite(guest::DR7, value),
            RegisterId::Dr(index) => platform.write_dr(index, value),
            RegisterId::Cr(0) => platform.vmwrite(guest::CR0, value),
            RegisterId::Cr(3) => platform.vmwrite(guest::CR3, value),
            RegisterId::Cr(4) => platform.vmwrite(guest::CR4, value),
            RegisterId::Cr(index) => platform.write_cr(index, value),
        }
    }

    fn pseudo_register(&self, register: PseudoRegister) -> u64 {
        let platform = self.ctx.platform;
        match register {
            PseudoRegister::Tid => u64::from(platform.process_info().tid),
            PseudoRegister::Pid => u64::from(platform.process_info().pid),
            PseudoRegister::Pname => {
                let name = platform.process_info().name;
                u64::from_le_bytes([name[0], name[1], name[2], name[3], name[4], name[5], name[6], name[7]])
            }
            PseudoRegister::Core => u64::from(self.ctx.core()),
            PseudoRegister::Proc => platform.process_info().process,
            PseudoRegister::Thread => platform.process_info().thread,
            PseudoRegister::Peb => platform.process_info().peb,
            PseudoRegister::Teb => platform.process_info().teb,
            PseudoRegister::Ip => self.ctx.registers.rip,
            PseudoRegister::Buffer => self.buffer.map(|buffer| buffer.va()).unwrap_or(0),
            PseudoRegister::Context => self.context,
            PseudoRegister::EventTag => self.tag,
            PseudoRegister::EventId => self.tag.wrapping_sub(TAG_SEED),
            PseudoRegister::EventStage => match self.stage {
                EventStage::Pre => 0,
                EventStage::Post => 1,
                EventStage::All => 2,
            },
            PseudoRegister::Time => clock_time(platform.system_time()),
            PseudoRegister::Date => clock_date(platform.system_time()),
        }
    }

    fn read_memory(&self, address: u64, buffer: &mut [u8], physical: bool) -> bool {
        let platform = self.ctx.platform;
        if physical {
            mapper::read_physical(platform, address, buffer).is_ok()
        } else {
            mapper::read_virtual(platform, self.cr3, address, buffer).is_ok()
        }
    }

    fn write_memory(&mut self, address: u64, data: &[u8], physical: bool) -> bool {
        let platform = self.ctx.platform;
        if physical {
            mapper::write_physical(platform, address, data).is_ok()
        } else {
            mapper::write_virtual(platform, self.cr3, address, data).is_ok()
        }
    }

    fn check_address(&self, address: u64, size: usize) -> bool {
        mapper::check_access(self.ctx.platform, self.cr3, address, size)
    }

    fn virtual_to_physical(&self, va: u64) -> Option<u64> {
        mapper::virtual_to_physical(self.ctx.platform, self.cr3, va).ok()
    }

    fn physical_to_virtual(&self, pa: u64) -> Option<u64> {
        mapper::physical_to_virtual(self.ctx.platform, pa).ok()
    }

    fn print(&mut self, message: &str) {
        self.ctx.state.messages.push(self.tag, self.immediate, message);
    }

    fn modify_event(&mut self, tag: u64, action: ModifyAction) -> bool {
        match events::modify_event(self.ctx.platform, self.ctx.state, tag, action) {
            Ok(result) => result,
            Err(error) => {
                log::debug!("Script could not modify event {:#x}: {}", tag, error);
                false
            }
        }
    }

    fn set_short_circuit(&mut self, enabled: bool) {
        self.short_circuit = Some(enabled);
    }

    fn inject_event(&mut self, vector: u8, error_code: Option<u32>) {
        EventInjection::inject(self.ctx.platform, vector, InterruptionType::HardwareException, error_code, 0);
    }

    fn pause(&mut self) {
        let (tag, context) = (self.tag, self.context);
        session::halt(self.ctx, PausingReason::Pause, tag, context);
    }

    fn flush(&mut self) {
        let dropped = self.ctx.state.messages.flush();
        log::trace!("Flushed {} messages", dropped);
    }

    fn rdtsc(&self) -> u64 {
        self.ctx.platform.rdtsc()
    }

    fn rdtscp(&self) -> (u64, u32) {
        self.ctx.platform.rdtscp()
    }

    fn microsleep(&self, microseconds: u64) {
        self.ctx.platform.microsleep(microseconds);
    }

    fn globals(&self) -> &[AtomicU64] {
        &self.ctx.state.script_globals
    }

    fn test_statement(&mut self, value: u64) {
        log::info!("Script test statement: {:#x}", value);
    }

    fn code_bitness(&self) -> u32 {
        disassembler::guest_bitness(self.ctx.platform)
    }
}

/// Civil date of a day count relative to 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let day_of_era = z.rem_euclid(146_097) as u64;
    let year_of_era = (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = year_of_era as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `hhmmss` of a system time, as a decimal number.
pub fn clock_time(system_time: u64) -> u64 {
    let seconds = (system_time / TICKS_PER_SECOND) % 86_400;
    (seconds / 3600) * 10_000 + ((seconds / 60) % 60) * 100 + seconds % 60
}

/// `yyyymmdd` of a system time, as a decimal number.
pub fn clock_date(system_time: u64) -> u64 {
    let days = (system_time / TICKS_PER_SECOND / 86_400) as i64 - EPOCH_DIFFERENCE_DAYS;
    let (year, month, day) = civil_from_days(days);
    (year.max(0) as u64) * 10_000 + month * 100 + day
}
