//! Debug events: what to intercept, where, and what to do when it happens.
//!
//! An event names a VM-exit facility (an MSR read, an exception vector, a hidden hook, ...), a
//! scope (core, process, thread), optional parameters and a list of actions. Registration turns
//! the event into interceptions on the affected processors; the exit handlers then call
//! [`trigger::trigger_events`] for every matching exit.

use {
    crate::{
        debugger::{
            hooks,
            script::Script,
        },
        error::HypervisorError,
        intel::{ept::AccessType, registers::GuestRegisters, vcpu::Interception},
        memory::{
            mapper,
            pool::{PoolBlock, PoolIntention},
        },
        platform::Platform,
        CoreState,
    },
    alloc::{sync::Arc, vec, vec::Vec},
    core::sync::atomic::{AtomicBool, AtomicU64, Ordering},
    spin::RwLock,
};

pub mod registry;
pub mod resources;
pub mod trigger;

/// Wildcard for the core, process, thread and parameter filters.
pub const APPLY_TO_ALL: u32 = 0xFFFF_FFFF;

/// Wildcard for 64-bit parameters.
pub const APPLY_TO_ALL_PARAM: u64 = 0xFFFF_FFFF;

/// Tag that makes a modification apply to every event.
pub const ALL_TAGS: u64 = u64::MAX;

/// First tag handed out.
pub const TAG_SEED: u64 = 0x100_0000;

/// Every kind of event, in wire order.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    HiddenHookReadWriteExecute = 0,
    HiddenHookReadWrite,
    HiddenHookReadExecute,
    HiddenHookWriteExecute,
    HiddenHookRead,
    HiddenHookWrite,
    HiddenHookExecute,
    HiddenHookExecDetours,
    HiddenHookExecCc,
    SyscallHookEferSyscall,
    SyscallHookEferSysret,
    CpuidInstructionExecution,
    RdmsrInstructionExecution,
    WrmsrInstructionExecution,
    InInstructionExecution,
    OutInstructionExecution,
    ExceptionOccurred,
    ExternalInterruptOccurred,
    DebugRegistersAccessed,
    TscInstructionExecution,
    PmcInstructionExecution,
    VmcallInstructionExecution,
    ControlRegisterModified,
    ControlRegisterRead,
    ControlRegister3Modified,
    TrapExecutionModeChanged,
    TrapExecutionInstructionTrace,
    XsetbvInstructionExecution,
}

impl EventType {
    pub const COUNT: usize = EventType::XsetbvInstructionExecution as usize + 1;

    pub const ALL: [EventType; EventType::COUNT] = [
        EventType::HiddenHookReadWriteExecute,
        EventType::HiddenHookReadWrite,
        EventType::HiddenHookReadExecute,
        EventType::HiddenHookWriteExecute,
        EventType::HiddenHookRead,
        EventType::HiddenHookWrite,
        EventType::HiddenHookExecute,
        EventType::HiddenHookExecDetours,
        EventType::HiddenHookExecCc,
        EventType::SyscallHookEferSyscall,
        EventType::SyscallHookEferSysret,
        EventType::CpuidInstructionExecution,
        EventType::RdmsrInstructionExecution,
        EventType::WrmsrInstructionExecution,
        EventType::InInstructionExecution,
        EventType::OutInstructionExecution,
        EventType::ExceptionOccurred,
        EventType::ExternalInterruptOccurred,
        EventType::DebugRegistersAccessed,
        EventType::TscInstructionExecution,
        EventType::PmcInstructionExecution,
        EventType::VmcallInstructionExecution,
        EventType::ControlRegisterModified,
        EventType::ControlRegisterRead,
        EventType::ControlRegister3Modified,
        EventType::TrapExecutionModeChanged,
        EventType::TrapExecutionInstructionTrace,
        EventType::XsetbvInstructionExecution,
    ];

    pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
        Self::ALL.get(value as usize).copied().ok_or(HypervisorError::UnknownEventType)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// The rights an EPT monitor removes for this event, if it is one.
    pub fn monitored_access(self) -> Option<AccessType> {
        Some(match self {
            EventType::HiddenHookReadWriteExecute => AccessType::READ_WRITE_EXECUTE,
            EventType::HiddenHookReadWrite => AccessType::READ_WRITE,
            EventType::HiddenHookReadExecute => AccessType::READ | AccessType::EXECUTE,
            EventType::HiddenHookWriteExecute => AccessType::WRITE | AccessType::EXECUTE,
            EventType::HiddenHookRead => AccessType::READ,
            EventType::HiddenHookWrite => AccessType::WRITE,
            EventType::HiddenHookExecute => AccessType::EXECUTE,
            _ => return None,
        })
    }

    pub fn is_hidden_hook(self) -> bool {
        self.monitored_access().is_some() || matches!(self, EventType::HiddenHookExecDetours | EventType::HiddenHookExecCc)
    }
}

/// When an event runs relative to the emulation of the intercepted instruction.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventStage {
    Pre = 1,
    Post = 2,
    All = 3,
}

impl EventStage {
    pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
        match value {
            1 => Ok(EventStage::Pre),
            2 => Ok(EventStage::Post),
            3 => Ok(EventStage::All),
            _ => Err(HypervisorError::BadEventDescriptor),
        }
    }

    /// Whether an event registered for `self` runs when `current` is triggered.
    pub fn includes(self, current: EventStage) -> bool {
        self == EventStage::All || self == current
    }
}

/// Privilege transitions reported by `TrapExecutionModeChanged`.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModeTrapKind {
    KernelMode = 0,
    UserAndKernelMode = 1,
    UserMode = 3,
}

impl ModeTrapKind {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(ModeTrapKind::KernelMode),
            1 => Some(ModeTrapKind::UserAndKernelMode),
            3 => Some(ModeTrapKind::UserMode),
            _ => None,
        }
    }

    /// Whether a switch into privilege level `cpl` is reported.
    pub fn reports(self, cpl: u8) -> bool {
        match self {
            ModeTrapKind::UserAndKernelMode => true,
            ModeTrapKind::KernelMode => cpl == 0,
            ModeTrapKind::UserMode => cpl == 3,
        }
    }
}

/// How `!syscall` and `!sysret` events recognise their instruction on #UD.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyscallTrapKind {
    /// Only treat the #UD as a syscall/sysret when the opcode bytes are readable and match.
    SafeAccessMemory = 0,
    /// Also treat a #UD with unreadable opcode bytes as a syscall/sysret.
    HandleAllUd = 1,
}

/// Which processor, process and thread an event applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventScope {
    pub core: u32,
    pub pid: u32,
    pub tid: u32,
}

impl EventScope {
    pub const ALL: EventScope = EventScope { core: APPLY_TO_ALL, pid: APPLY_TO_ALL, tid: APPLY_TO_ALL };
}

impl Default for EventScope {
    fn default() -> Self {
        Self::ALL
    }
}

/// A registration request, as decoded from an IOCTL or a debugger packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub event_type: EventType,
    pub scope: EventScope,
    pub params: [u64; 6],
    pub stage: EventStage,
    pub enabled: bool,
    pub short_circuit: bool,
    /// Compiled condition; the event only fires when it returns non-zero.
    pub condition: Option<Vec<u8>>,
}

impl EventDescriptor {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            scope: EventScope::ALL,
            params: [APPLY_TO_ALL_PARAM, 0, 0, 0, 0, 0],
            stage: EventStage::Pre,
            enabled: true,
            short_circuit: false,
            condition: None,
        }
    }
}

/// The kind of an action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    BreakToDebugger,
    RunScript(Vec<u8>),
    /// Index into the custom code table.
    RunCustomCode(u32),
}

/// An action registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub request: ActionRequest,
    pub immediate_messaging: bool,
    /// Size of the buffer exposed to the action as `$buffer`, or 0 for none.
    pub buffer_size: usize,
    /// Number of executions after which the action stops running, or 0 for no limit.
    pub repetition_limit: u64,
}

impl ActionDescriptor {
    pub fn new(request: ActionRequest) -> Self {
        Self { request, immediate_messaging: false, buffer_size: 0, repetition_limit: 0 }
    }
}

pub enum ActionKind {
    BreakToDebugger,
    RunScript(Script),
    RunCustomCode(u32),
}

pub struct Action {
    pub kind: ActionKind,
    pub immediate_messaging: bool,
    pub buffer: Option<PoolBlock>,
    pub repetition_limit: u64,
    executions: AtomicU64,
}

impl Action {
    /// Counts one execution. Returns false once the repetition limit is exhausted.
    pub fn take_execution(&self) -> bool {
        let previous = self.executions.fetch_add(1, Ordering::Relaxed);
        self.repetition_limit == 0 || previous < self.repetition_limit
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

/// State handed to a custom code callback.
pub struct CustomCodeContext<'a> {
    pub tag: u64,
    pub context: u64,
    pub registers: &'a mut GuestRegisters,
    pub buffer: Option<PoolBlock>,
    /// Set by the callback to skip the emulation of the intercepted instruction.
    pub short_circuit: bool,
}

pub type CustomCodeFn = fn(&mut CustomCodeContext<'_>);

/// Maximum number of custom code callbacks.
pub const MAX_CUSTOM_CODE: usize = 64;

/// Callbacks that `RunCustomCode` actions can name by index.
#[derive(Default)]
pub struct CustomCodeTable {
    entries: RwLock<Vec<CustomCodeFn>>,
}

impl CustomCodeTable {
    /// Adds a callback and returns its index.
    pub fn register(&self, callback: CustomCodeFn) -> Result<u32, HypervisorError> {
        let mut entries = self.entries.write();
        if entries.len() >= MAX_CUSTOM_CODE {
            return Err(HypervisorError::OutOfPool);
        }
        entries.push(callback);
        Ok(entries.len() as u32 - 1)
    }

    pub fn get(&self, index: u32) -> Option<CustomCodeFn> {
        self.entries.read().get(index as usize).copied()
    }
}

/// A registered event.
pub struct Event {
    pub tag: u64,
    pub event_type: EventType,
    pub scope: EventScope,
    pub params: [u64; 6],
    pub stage: EventStage,
    pub condition: Option<Script>,
    enabled: AtomicBool,
    short_circuit: AtomicBool,
    hit_count: AtomicU64,
    actions: RwLock<Vec<Arc<Action>>>,
    /// Interceptions acquired at registration, released at termination.
    interceptions: Vec<(u32, Interception)>,
}

impl Event {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn short_circuit(&self) -> bool {
        self.short_circuit.load(Ordering::Acquire)
    }

    pub fn set_short_circuit(&self, enabled: bool) {
        self.short_circuit.store(enabled, Ordering::Release);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The actions at the time of the call. Later additions are not observed.
    pub fn actions(&self) -> Vec<Arc<Action>> {
        self.actions.read().clone()
    }

    /// Whether the event applies to processor `core`.
    pub fn matches_core(&self, core: u32) -> bool {
        self.scope.core == APPLY_TO_ALL || self.scope.core == core
    }

    /// Whether the first parameter is the wildcard or equal to `value`.
    pub fn matches_param(&self, value: u64) -> bool {
        self.params[0] == APPLY_TO_ALL_PARAM || self.params[0] == value
    }
}

/// What a modification request does.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModifyAction {
    QueryState = 0,
    Enable = 1,
    Disable = 2,
    Clear = 3,
}

impl ModifyAction {
    pub fn from_u32(value: u32) -> Result<Self, HypervisorError> {
        match value {
            0 => Ok(ModifyAction::QueryState),
            1 => Ok(ModifyAction::Enable),
            2 => Ok(ModifyAction::Disable),
            3 => Ok(ModifyAction::Clear),
            _ => Err(HypervisorError::BadEventDescriptor),
        }
    }
}

/// The interceptions an event needs on each processor it applies to.
fn required_interceptions(descriptor: &EventDescriptor) -> Result<Vec<Interception>, HypervisorError> {
    let param = descriptor.params[0];
    let all = param == APPLY_TO_ALL_PARAM;

    let interceptions = match descriptor.event_type {
        EventType::RdmsrInstructionExecution => vec![Interception::MsrRead((!all).then_some(param as u32))],
        EventType::WrmsrInstructionExecution => vec![Interception::MsrWrite((!all).then_some(param as u32))],
        EventType::InInstructionExecution | EventType::OutInstructionExecution => {
            if !all && param > u64::from(u16::MAX) {
                return Err(HypervisorError::BadEventDescriptor);
            }
            vec![Interception::IoPort((!all).then_some(param as u16))]
        }
        EventType::ExceptionOccurred => {
            if !all && param >= 32 {
                return Err(HypervisorError::BadEventDescriptor);
            }
            vec![Interception::Exception((!all).then_some(param as u8))]
        }
        EventType::ExternalInterruptOccurred => {
            if !all && !(32..=255).contains(&param) {
                return Err(HypervisorError::BadEventDescriptor);
            }
            vec![Interception::ExternalInterruptExiting]
        }
        EventType::TscInstructionExecution => vec![Interception::RdtscExiting],
        EventType::PmcInstructionExecution => vec![Interception::RdpmcExiting],
        EventType::DebugRegistersAccessed => vec![Interception::MovDrExiting],
        EventType::ControlRegisterModified => vec![Interception::CrWrite(param as u8)],
        EventType::ControlRegisterRead => vec![Interception::CrRead(param as u8)],
        EventType::ControlRegister3Modified => vec![Interception::CrWrite(3)],
        EventType::SyscallHookEferSyscall | EventType::SyscallHookEferSysret => vec![Interception::SyscallEfer],
        EventType::TrapExecutionModeChanged => {
            ModeTrapKind::from_u64(param).ok_or(HypervisorError::BadEventDescriptor)?;
            vec![Interception::ModeTrap]
        }
        EventType::TrapExecutionInstructionTrace => vec![Interception::InstructionTrace],
        EventType::HiddenHookExecCc => vec![Interception::Exception(Some(3))],
        EventType::CpuidInstructionExecution
        | EventType::VmcallInstructionExecution
        | EventType::XsetbvInstructionExecution
        | EventType::HiddenHookExecDetours => Vec::new(),
        monitor => {
            debug_assert!(monitor.monitored_access().is_some());
            Vec::new()
        }
    };

    if matches!(descriptor.event_type, EventType::ControlRegisterModified | EventType::ControlRegisterRead) {
        interceptions.iter().try_for_each(|interception| interception.validate())?;
    }

    Ok(interceptions)
}

fn validate(platform: &dyn Platform, descriptor: &EventDescriptor) -> Result<(), HypervisorError> {
    if descriptor.short_circuit && descriptor.stage != EventStage::Pre {
        log::warn!("Short-circuiting is only valid for pre-events");
        return Err(HypervisorError::BadEventDescriptor);
    }

    if descriptor.scope.core != APPLY_TO_ALL && descriptor.scope.core >= platform.processor_count() {
        return Err(HypervisorError::BadEventDescriptor);
    }

    if descriptor.event_type.monitored_access().is_some() {
        let (start, end) = (descriptor.params[0], descriptor.params[1]);
        if end <= start {
            return Err(HypervisorError::BadEventDescriptor);
        }
    }

    Ok(())
}

/// The processors an event with scope `core` is activated on.
pub fn target_cores(platform: &dyn Platform, core: u32) -> Vec<u32> {
    if core == APPLY_TO_ALL {
        (0..platform.processor_count()).collect()
    } else {
        vec![core]
    }
}

fn build_action(platform: &dyn Platform, state: &CoreState, descriptor: ActionDescriptor) -> Result<Action, HypervisorError> {
    let kind = match descriptor.request {
        ActionRequest::BreakToDebugger => ActionKind::BreakToDebugger,
        ActionRequest::RunScript(blob) => ActionKind::RunScript(Script::parse(&blob)?),
        ActionRequest::RunCustomCode(index) => {
            state.custom_code.get(index).ok_or(HypervisorError::BadEventDescriptor)?;
            ActionKind::RunCustomCode(index)
        }
    };

    let buffer = match descriptor.buffer_size {
        0 => None,
        size => {
            let block = match state.pool.allocate(PoolIntention::EventBuffer, size) {
                Ok(block) => block,
                Err(_) => {
                    state.pool.reserve(platform, size, 1, PoolIntention::EventBuffer)?;
                    state.pool.allocate(PoolIntention::EventBuffer, size)?
                }
            };
            Some(block)
        }
    };

    Ok(Action {
        kind,
        immediate_messaging: descriptor.immediate_messaging,
        buffer,
        repetition_limit: descriptor.repetition_limit,
        executions: AtomicU64::new(0),
    })
}

/// Installs the hidden hook an event relies on.
fn install_hook(platform: &dyn Platform, state: &CoreState, descriptor: &EventDescriptor, tag: u64) -> Result<(), HypervisorError> {
    let pid = (descriptor.scope.pid != APPLY_TO_ALL).then_some(descriptor.scope.pid);
    let cr3 = mapper::cr3_of(platform, pid)?;

    match descriptor.event_type {
        EventType::HiddenHookExecCc => hooks::install_cc_hook(platform, state, cr3, descriptor.params[0], tag),
        EventType::HiddenHookExecDetours => hooks::install_detour_hook(platform, state, cr3, descriptor.params[0], tag),
        other => {
            let access = other.monitored_access().ok_or(HypervisorError::UnknownEventType)?;
            hooks::install_monitor(platform, state, cr3, descriptor.params[0], descriptor.params[1], access, tag)
        }
    }
}

/// Registers an event and activates everything it needs.
///
/// # Arguments
///
/// * `platform` - The platform the interceptions are configured through.
/// * `state` - The engine state the event is added to.
/// * `descriptor` - What to intercept and where.
/// * `actions` - What to do when the event fires, in order.
///
/// # Returns
///
/// The tag of the new event.
pub fn register_event(
    platform: &dyn Platform,
    state: &CoreState,
    descriptor: EventDescriptor,
    actions: Vec<ActionDescriptor>,
) -> Result<u64, HypervisorError> {
    validate(platform, &descriptor)?;
    let interceptions = required_interceptions(&descriptor)?;

    let condition = descriptor.condition.as_deref().map(Script::parse).transpose()?;
    let actions = actions
        .into_iter()
        .map(|action| build_action(platform, state, action).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;

    let tag = state.events.allocate_tag();

    let mut acquired = Vec::new();
    for core in target_cores(platform, descriptor.scope.core) {
        for interception in &interceptions {
            if let Err(error) = state.resources.acquire(platform, core, *interception) {
                release_all(platform, state, &acquired);
                release_buffers(platform, state, &actions);
                return Err(error);
            }
            acquired.push((core, *interception));
        }
    }

    if descriptor.event_type.is_hidden_hook() {
        if let Err(error) = install_hook(platform, state, &descriptor, tag) {
            log::warn!("Hook for event {:#x} failed: {}", tag, error);
            release_all(platform, state, &acquired);
            release_buffers(platform, state, &actions);
            return Err(error);
        }
    }

    let event = Event {
        tag,
        event_type: descriptor.event_type,
        scope: descriptor.scope,
        params: descriptor.params,
        stage: descriptor.stage,
        condition,
        enabled: AtomicBool::new(descriptor.enabled),
        short_circuit: AtomicBool::new(descriptor.short_circuit),
        hit_count: AtomicU64::new(0),
        actions: RwLock::new(actions),
        interceptions: acquired,
    };

    state.events.insert(Arc::new(event));
    log::info!("Registered {:?} event {:#x}", descriptor.event_type, tag);

    Ok(tag)
}

fn release_all(platform: &dyn Platform, state: &CoreState, acquired: &[(u32, Interception)]) {
    for (core, interception) in acquired {
        state.resources.release(platform, *core, *interception);
    }
}

fn release_buffers(platform: &dyn Platform, state: &CoreState, actions: &[Arc<Action>]) {
    for buffer in actions.iter().filter_map(|action| action.buffer) {
        state.pool.free(platform, buffer);
    }
}

/// Appends an action to an existing event.
pub fn add_action(platform: &dyn Platform, state: &CoreState, tag: u64, descriptor: ActionDescriptor) -> Result<(), HypervisorError> {
    let event = state.events.find(tag).ok_or(HypervisorError::TagNotFound)?;
    let action = Arc::new(build_action(platform, state, descriptor)?);
    event.actions.write().push(action);
    log::info!("Added action to event {:#x}", tag);
    Ok(())
}

/// Enables, disables, clears or queries one event, or every event for [`ALL_TAGS`].
///
/// Returns the enabled state for `QueryState` and `true` otherwise.
pub fn modify_event(platform: &dyn Platform, state: &CoreState, tag: u64, action: ModifyAction) -> Result<bool, HypervisorError> {
    let targets = if tag == ALL_TAGS {
        if action == ModifyAction::QueryState {
            return Err(HypervisorError::BadEventDescriptor);
        }
        state.events.all()
    } else {
        vec![state.events.find(tag).ok_or(HypervisorError::TagNotFound)?]
    };

    for event in targets {
        match action {
            ModifyAction::QueryState => return Ok(event.is_enabled()),
            ModifyAction::Enable => event.set_enabled(true),
            ModifyAction::Disable => event.set_enabled(false),
            ModifyAction::Clear => terminate_event(platform, state, event.tag)?,
        }
    }

    Ok(true)
}

/// Removes an event, its hooks and its interceptions.
///
/// Processors that are running the event's actions keep their snapshot alive; the action buffers
/// return to the pool once every processor has passed a VM exit.
pub fn terminate_event(platform: &dyn Platform, state: &CoreState, tag: u64) -> Result<(), HypervisorError> {
    let event = state.events.remove(tag).ok_or(HypervisorError::TagNotFound)?;
    event.set_enabled(false);

    if event.event_type.is_hidden_hook() {
        hooks::remove_hooks_of_event(platform, state, tag)?;
    }

    release_all(platform, state, &event.interceptions);

    let generation = state.resources.request_synchronization(platform);
    for buffer in event.actions().iter().filter_map(|action| action.buffer) {
        state.pool.free_after(buffer, generation);
    }

    log::info!("Terminated event {:#x} after {} hits", tag, event.hit_count());
    Ok(())
}

/// Terminates every event. Used at unload and when the debugger closes.
pub fn clear_all(platform: &dyn Platform, state: &CoreState) {
    for event in state.events.all() {
        if let Err(error) = terminate_event(platform, state, event.tag) {
            log::warn!("Failed to terminate event {:#x}: {}", event.tag, error);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{config::Config, platform::mock::MockPlatform},
    };

    pub(crate) fn setup(processors: u32) -> (MockPlatform, CoreState) {
        let platform = crate::tests::permissive_platform(processors);
        let state = CoreState::new(&platform, Config::default()).unwrap();
        (platform, state)
    }

    #[test]
    fn test_register_acquires_interceptions_on_every_core() {
        let (platform, state) = setup(2);
        let mut descriptor = EventDescriptor::new(EventType::RdmsrInstructionExecution);
        descriptor.params[0] = 0xC000_0082;

        let tag = register_event(&platform, &state, descriptor, vec![]).unwrap();
        assert_eq!(tag, TAG_SEED);

        for core in 0..2 {
            assert_eq!(state.resources.count(core, Interception::MsrRead(Some(0xC000_0082))), 1);
        }

        terminate_event(&platform, &state, tag).unwrap();
        assert_eq!(state.resources.count(0, Interception::MsrRead(Some(0xC000_0082))), 0);
        assert_eq!(terminate_event(&platform, &state, tag), Err(HypervisorError::TagNotFound));
    }

    #[test]
    fn test_descriptor_validation() {
        let (platform, state) = setup(1);

        let mut exception = EventDescriptor::new(EventType::ExceptionOccurred);
        exception.params[0] = 32;
        assert_eq!(register_event(&platform, &state, exception, vec![]), Err(HypervisorError::BadEventDescriptor));

        let mut monitor = EventDescriptor::new(EventType::HiddenHookWrite);
        monitor.params[0] = 0x1000;
        monitor.params[1] = 0x1000;
        assert_eq!(register_event(&platform, &state, monitor, vec![]), Err(HypervisorError::BadEventDescriptor));

        let mut post_short_circuit = EventDescriptor::new(EventType::CpuidInstructionExecution);
        post_short_circuit.stage = EventStage::Post;
        post_short_circuit.short_circuit = true;
        assert_eq!(register_event(&platform, &state, post_short_circuit, vec![]), Err(HypervisorError::BadEventDescriptor));

        let mut bad_core = EventDescriptor::new(EventType::CpuidInstructionExecution);
        bad_core.scope.core = 4;
        assert_eq!(register_event(&platform, &state, bad_core, vec![]), Err(HypervisorError::BadEventDescriptor));

        let mut cr_read = EventDescriptor::new(EventType::ControlRegisterRead);
        cr_read.params[0] = 0;
        assert_eq!(register_event(&platform, &state, cr_read, vec![]), Err(HypervisorError::CouldNotActivateInterception));

        assert_eq!(EventType::from_u32(28), Err(HypervisorError::UnknownEventType));
    }

    #[test]
    fn test_modify_and_query() {
        let (platform, state) = setup(1);
        let first = register_event(&platform, &state, EventDescriptor::new(EventType::CpuidInstructionExecution), vec![]).unwrap();
        let second = register_event(&platform, &state, EventDescriptor::new(EventType::VmcallInstructionExecution), vec![]).unwrap();
        assert_eq!(second, first + 1);

        assert_eq!(modify_event(&platform, &state, first, ModifyAction::Disable), Ok(true));
        assert_eq!(modify_event(&platform, &state, first, ModifyAction::QueryState), Ok(false));
        assert_eq!(modify_event(&platform, &state, second, ModifyAction::QueryState), Ok(true));

        modify_event(&platform, &state, ALL_TAGS, ModifyAction::Disable).unwrap();
        assert_eq!(modify_event(&platform, &state, second, ModifyAction::QueryState), Ok(false));
        assert_eq!(modify_event(&platform, &state, ALL_TAGS, ModifyAction::QueryState), Err(HypervisorError::BadEventDescriptor));

        modify_event(&platform, &state, ALL_TAGS, ModifyAction::Clear).unwrap();
        assert!(state.events.all().is_empty());
        assert_eq!(modify_event(&platform, &state, first, ModifyAction::Enable), Err(HypervisorError::TagNotFound));
    }

    #[test]
    fn test_action_buffer_is_reclaimed_after_synchronization() {
        let (platform, state) = setup(1);
        let mut action = ActionDescriptor::new(ActionRequest::BreakToDebugger);
        action.buffer_size = 0x100;

        let tag = register_event(&platform, &state, EventDescriptor::new(EventType::CpuidInstructionExecution), vec![action]).unwrap();
        let buffer = state.events.find(tag).unwrap().actions()[0].buffer.unwrap();
        assert_eq!(buffer.intention, PoolIntention::EventBuffer);

        terminate_event(&platform, &state, tag).unwrap();
        assert_eq!(state.pool.retired(), 1);
    }

    #[test]
    fn test_unknown_custom_code_is_rejected() {
        let (platform, state) = setup(1);
        let action = ActionDescriptor::new(ActionRequest::RunCustomCode(7));
        assert_eq!(
            register_event(&platform, &state, EventDescriptor::new(EventType::CpuidInstructionExecution), vec![action]),
            Err(HypervisorError::BadEventDescriptor)
        );
    }
}
