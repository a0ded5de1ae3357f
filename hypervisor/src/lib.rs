//! A hypervisor-assisted debugger core.
//!
//! Every logical processor runs the guest under VMX. VM exits feed a debug event engine (events,
//! conditions, scripts, hidden EPT hooks, breakpoints, stepping) and a kernel debug protocol that
//! halts the whole system for a remote debugger.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use {
    crate::{
        config::Config,
        debugger::{
            breakpoints::BreakpointManager,
            events::{registry::EventRegistry, resources::ResourceController, CustomCodeTable},
            hooks::HookManager,
            messages::{MessageSink, MESSAGE_RING_CAPACITY},
            script::GLOBAL_VARIABLE_COUNT,
            session::DebuggerSession,
            stepping::SteppingState,
            symbols::SymbolTable,
            transparency::Transparency,
        },
        error::HypervisorError,
        intel::{
            ept::{mtrr::Mtrr, paging::Ept, PAGE_SIZE},
            vcpu::VcpuState,
        },
        memory::pool::{PoolIntention, PoolManager},
        platform::Platform,
    },
    alloc::vec::Vec,
    core::sync::atomic::AtomicU64,
    spin::{Mutex, Once},
};

pub mod config;
pub mod debugger;
pub mod error;
pub mod intel;
pub mod memory;
pub mod platform;

/// Engine state shared by every processor.
///
/// Per-processor state lives in `vcpus`, indexed by processor number; everything else is
/// reachable from any processor behind its own lock.
pub struct CoreState {
    pub config: Config,
    pub pool: PoolManager,
    pub ept: Mutex<Ept>,
    pub events: EventRegistry,
    pub resources: ResourceController,
    pub custom_code: CustomCodeTable,
    /// Script global variables, shared by every processor.
    pub script_globals: Vec<AtomicU64>,
    pub messages: MessageSink,
    pub hooks: HookManager,
    pub breakpoints: BreakpointManager,
    pub stepping: SteppingState,
    pub session: DebuggerSession,
    pub transparency: Transparency,
    pub symbols: SymbolTable,
    pub vcpus: Vec<Mutex<VcpuState>>,
}

impl CoreState {
    /// Builds the engine state for every processor of `platform`.
    ///
    /// Must run before any processor enters VMX operation: the EPT identity map, the per-processor
    /// bitmaps and the preallocated pools are all allocated here.
    ///
    /// # Arguments
    ///
    /// * `platform` - The machine being virtualized.
    /// * `config` - Settings loaded from `config.ini`.
    pub fn new(platform: &dyn Platform, config: Config) -> Result<Self, HypervisorError> {
        let processor_count = platform.processor_count();
        log::info!("Initializing engine state for {} processors", processor_count);

        let mtrr_map = Mtrr::build_mtrr_map(platform);
        let mut ept = Ept::new(platform, &mtrr_map)?;
        ept.reserve_split_tables(config.preallocated_pools as usize)?;

        let pool = PoolManager::new();
        pool.reserve(platform, PAGE_SIZE as usize, config.preallocated_pools as usize, PoolIntention::ShadowPage)?;

        let vcpus = (0..processor_count).map(|index| VcpuState::new(index).map(Mutex::new)).collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            pool,
            ept: Mutex::new(ept),
            events: EventRegistry::new(),
            resources: ResourceController::new(processor_count),
            custom_code: CustomCodeTable::default(),
            script_globals: (0..GLOBAL_VARIABLE_COUNT).map(|_| AtomicU64::new(0)).collect(),
            messages: MessageSink::new(MESSAGE_RING_CAPACITY),
            hooks: HookManager::new(),
            breakpoints: BreakpointManager::new(),
            stepping: SteppingState::new(),
            session: DebuggerSession::new(processor_count),
            transparency: Transparency::new(processor_count),
            symbols: SymbolTable::new(),
            vcpus,
        })
    }

    /// Removes every event, hook and breakpoint and returns the pools to the system. The
    /// processors must have left VMX operation.
    pub fn teardown(&self, platform: &dyn Platform) {
        log::info!("Tearing down engine state");

        self.session.set_handler(None);
        debugger::breakpoints::clear_all(platform, self);
        debugger::events::clear_all(platform, self);
        self.pool.release_all(platform);
    }
}

static CORE_STATE: Once<CoreState> = Once::new();

/// Builds the global engine state once. Later calls return the existing state.
pub fn initialize(platform: &dyn Platform, config: Config) -> Result<&'static CoreState, HypervisorError> {
    CORE_STATE.try_call_once(|| CoreState::new(platform, config))
}

/// The global engine state, once [`initialize`] has succeeded.
pub fn core_state() -> Option<&'static CoreState> {
    CORE_STATE.get()
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        crate::platform::mock::MockPlatform,
        x86::vmx::vmcs::guest,
    };

    /// A mock machine whose capability MSRs allow every control, running 64-bit code.
    pub(crate) fn permissive_platform(processors: u32) -> MockPlatform {
        let platform = MockPlatform::new(processors);
        platform.set_vmcs(guest::CS_ACCESS_RIGHTS, 0xA09B);
        platform.set_vmcs(guest::CS_SELECTOR, 0x10);
        platform
    }
}
