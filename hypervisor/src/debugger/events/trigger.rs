//! Runs the events of one type against the current VM exit.

use {
    super::{Action, ActionKind, CustomCodeContext, Event, EventStage, EventType, APPLY_TO_ALL},
    crate::{
        debugger::{
            script::host::ExitScriptHost,
            session::{self, PausingReason},
        },
        intel::vmexit::VmExitContext,
        platform::ProcessInfo,
    },
    alloc::sync::Arc,
};

/// What the exit handler has to do after triggering.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Skip the emulation of the intercepted instruction.
    pub short_circuit: bool,
    /// A `Post` or `All` event matched and wants the post stage.
    pub post_event_required: bool,
    /// Number of events whose actions ran.
    pub triggered: usize,
}

/// Triggers the events of `event_type` for `stage`.
///
/// Events run in registration order. Each event is filtered by core, process and thread, then by
/// `matches` (the parameter check of its type), then by its condition script. A condition that
/// faults or runs out of budget counts as no match.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `event_type` - The bucket to scan.
/// * `stage` - `Pre` before the emulation, `Post` after it.
/// * `context` - The value exposed as `$context` (MSR index, port, vector, address, ...).
/// * `matches` - Type specific filter on the event parameters.
pub fn trigger_events(
    ctx: &mut VmExitContext<'_>,
    event_type: EventType,
    stage: EventStage,
    context: u64,
    matches: &dyn Fn(&Event) -> bool,
) -> TriggerOutcome {
    let mut outcome = TriggerOutcome::default();
    let events = ctx.state.events.snapshot(event_type);
    if events.is_empty() {
        return outcome;
    }

    let core = ctx.core();
    let mut process: Option<ProcessInfo> = None;

    for event in events {
        if !event.is_enabled() || !event.matches_core(core) {
            continue;
        }

        if event.scope.pid != APPLY_TO_ALL || event.scope.tid != APPLY_TO_ALL {
            let info = *process.get_or_insert_with(|| ctx.platform.process_info());
            if (event.scope.pid != APPLY_TO_ALL && event.scope.pid != info.pid)
                || (event.scope.tid != APPLY_TO_ALL && event.scope.tid != info.tid)
            {
                continue;
            }
        }

        if !matches(&event) {
            continue;
        }

        if stage == EventStage::Pre && event.stage != EventStage::Pre {
            outcome.post_event_required = true;
        }

        if !event.stage.includes(stage) {
            continue;
        }

        if !condition_holds(ctx, &event, stage, context) {
            continue;
        }

        event.record_hit();
        outcome.triggered += 1;
        log::trace!("Event {:#x} ({:?}) triggered on core {}", event.tag, event_type, core);

        let mut short_circuit = event.short_circuit();
        for action in event.actions() {
            // A previous action may have disabled or cleared the event.
            if !event.is_enabled() {
                break;
            }
            if !action.take_execution() {
                continue;
            }
            if let Some(requested) = run_action(ctx, &event, &action, stage, context) {
                short_circuit = requested;
            }
        }

        outcome.short_circuit |= short_circuit;
    }

    ctx.vcpu.post_event_required = outcome.post_event_required;
    outcome
}

fn condition_holds(ctx: &mut VmExitContext<'_>, event: &Event, stage: EventStage, context: u64) -> bool {
    let Some(condition) = &event.condition else {
        return true;
    };

    let budget = ctx.state.config.script_max_instructions;
    let mut host = ExitScriptHost::new(ctx, event.tag, stage, context, None, false);
    match condition.run(&mut host, budget) {
        Ok(output) if output.memory_access_failed => {
            log::warn!("Condition of event {:#x} faulted on a memory access", event.tag);
            false
        }
        Ok(output) => output.return_value != 0,
        Err(error) => {
            log::warn!("Condition of event {:#x} failed: {}", event.tag, error);
            false
        }
    }
}

/// Runs one action. Returns the short-circuit state it requested, if any.
fn run_action(ctx: &mut VmExitContext<'_>, event: &Event, action: &Arc<Action>, stage: EventStage, context: u64) -> Option<bool> {
    match &action.kind {
        ActionKind::BreakToDebugger => {
            ctx.vcpu.debugger_short_circuit = None;
            session::halt(ctx, PausingReason::EventTriggered, event.tag, context);
            ctx.vcpu.debugger_short_circuit.take()
        }
        ActionKind::RunScript(script) => {
            let budget = ctx.state.config.script_max_instructions;
            let mut host = ExitScriptHost::new(ctx, event.tag, stage, context, action.buffer, action.immediate_messaging);
            match script.run(&mut host, budget) {
                Ok(output) if output.memory_access_failed => {
                    log::warn!("Script of event {:#x} stopped on an invalid memory access", event.tag)
                }
                Ok(_) => {}
                Err(error) => log::warn!("Script of event {:#x} failed: {}", event.tag, error),
            }
            host.short_circuit
        }
        ActionKind::RunCustomCode(index) => {
            let Some(callback) = ctx.state.custom_code.get(*index) else {
                log::warn!("Custom code {} of event {:#x} is gone", index, event.tag);
                return None;
            };

            let mut custom = CustomCodeContext {
                tag: event.tag,
                context,
                registers: ctx.registers,
                buffer: action.buffer,
                short_circuit: false,
            };
            callback(&mut custom);
            custom.short_circuit.then_some(true)
        }
    }
}

/// Runs the pre stage, the emulation unless short-circuited, then the post stage if an event
/// asked for it.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `event_type` - The bucket to scan.
/// * `context` - The value exposed as `$context`.
/// * `matches` - Type specific filter on the event parameters.
/// * `emulate` - Performs the architectural effect of the intercepted instruction.
pub fn dispatch(
    ctx: &mut VmExitContext<'_>,
    event_type: EventType,
    context: u64,
    matches: &dyn Fn(&Event) -> bool,
    emulate: impl FnOnce(&mut VmExitContext<'_>),
) -> TriggerOutcome {
    if !ctx.state.events.has_events(event_type) {
        emulate(ctx);
        return TriggerOutcome::default();
    }

    let pre = trigger_events(ctx, event_type, EventStage::Pre, context, matches);
    if pre.short_circuit {
        log::trace!("{:?} short-circuited", event_type);
        return pre;
    }

    emulate(ctx);

    if pre.post_event_required {
        let post = trigger_events(ctx, event_type, EventStage::Post, context, matches);
        return TriggerOutcome {
            short_circuit: false,
            post_event_required: true,
            triggered: pre.triggered + post.triggered,
        };
    }

    pre
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::{
                events::{register_event, tests::setup, ActionDescriptor, ActionRequest, EventDescriptor, EventScope, ModifyAction},
                script::{Opcode, PseudoRegister, ScriptBuilder, SymbolType},
            },
            intel::registers::GuestRegisters,
        },
        alloc::vec,
    };

    fn script_setting_rax(value: u64) -> Vec<u8> {
        ScriptBuilder::new().mov((SymbolType::Num, value), (SymbolType::Register, 0)).build()
    }

    #[test]
    fn test_disabled_event_does_not_fire() {
        let (platform, state) = setup(1);
        let mut descriptor = EventDescriptor::new(EventType::CpuidInstructionExecution);
        descriptor.enabled = false;
        let tag = register_event(&platform, &state, descriptor, vec![ActionDescriptor::new(ActionRequest::RunScript(script_setting_rax(7)))]).unwrap();

        let mut vcpu = crate::intel::vcpu::VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        let outcome = trigger_events(&mut ctx, EventType::CpuidInstructionExecution, EventStage::Pre, 0, &|_| true);
        assert_eq!(outcome.triggered, 0);
        assert_eq!(ctx.registers.rax, 0);

        crate::debugger::events::modify_event(&platform, &state, tag, ModifyAction::Enable).unwrap();
        let outcome = trigger_events(&mut ctx, EventType::CpuidInstructionExecution, EventStage::Pre, 0, &|_| true);
        assert_eq!(outcome.triggered, 1);
        assert_eq!(ctx.registers.rax, 7);
        assert_eq!(state.events.find(tag).unwrap().hit_count(), 1);
    }

    #[test]
    fn test_condition_filters_on_context() {
        let (platform, state) = setup(1);
        // return $context == 0xC0000082
        let condition = ScriptBuilder::new()
            .op(Opcode::Equal)
            .num(0xC000_0082)
            .pseudo(PseudoRegister::Context)
            .return_value()
            .build();

        let mut descriptor = EventDescriptor::new(EventType::RdmsrInstructionExecution);
        descriptor.condition = Some(condition);
        register_event(&platform, &state, descriptor, vec![ActionDescriptor::new(ActionRequest::RunScript(script_setting_rax(1)))]).unwrap();

        let mut vcpu = crate::intel::vcpu::VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert_eq!(trigger_events(&mut ctx, EventType::RdmsrInstructionExecution, EventStage::Pre, 0x10, &|_| true).triggered, 0);
        assert_eq!(trigger_events(&mut ctx, EventType::RdmsrInstructionExecution, EventStage::Pre, 0xC000_0082, &|_| true).triggered, 1);
    }

    #[test]
    fn test_stages_and_short_circuit() {
        let (platform, state) = setup(1);

        let mut post = EventDescriptor::new(EventType::CpuidInstructionExecution);
        post.stage = EventStage::Post;
        register_event(&platform, &state, post, vec![ActionDescriptor::new(ActionRequest::RunScript(script_setting_rax(2)))]).unwrap();

        let mut vcpu = crate::intel::vcpu::VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        let mut emulated = false;
        let outcome = dispatch(&mut ctx, EventType::CpuidInstructionExecution, 0, &|_| true, |ctx| {
            emulated = true;
            ctx.registers.rax = 1;
        });
        assert!(emulated);
        assert!(outcome.post_event_required);
        // The post event ran after the emulation.
        assert_eq!(ctx.registers.rax, 2);

        let mut short = EventDescriptor::new(EventType::CpuidInstructionExecution);
        short.short_circuit = true;
        register_event(&platform, &state, short, Vec::new()).unwrap();

        let mut emulated = false;
        let outcome = dispatch(&mut ctx, EventType::CpuidInstructionExecution, 0, &|_| true, |_| emulated = true);
        assert!(outcome.short_circuit);
        assert!(!emulated);
    }

    #[test]
    fn test_scope_filters_process() {
        let (platform, state) = setup(2);
        let mut descriptor = EventDescriptor::new(EventType::TscInstructionExecution);
        descriptor.scope = EventScope { core: 1, pid: 4, tid: APPLY_TO_ALL };
        register_event(&platform, &state, descriptor, Vec::new()).unwrap();

        let mut registers = GuestRegisters::default();
        let mut vcpu = crate::intel::vcpu::VcpuState::new(0).unwrap();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        assert_eq!(trigger_events(&mut ctx, EventType::TscInstructionExecution, EventStage::Pre, 0, &|_| true).triggered, 0);

        let mut vcpu = crate::intel::vcpu::VcpuState::new(1).unwrap();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        assert_eq!(trigger_events(&mut ctx, EventType::TscInstructionExecution, EventStage::Pre, 0, &|_| true).triggered, 1);
    }

    #[test]
    fn test_repetition_limit() {
        let (platform, state) = setup(1);
        let mut action = ActionDescriptor::new(ActionRequest::RunScript(
            ScriptBuilder::new().op(Opcode::Inc).register(0).build(),
        ));
        action.repetition_limit = 2;
        register_event(&platform, &state, EventDescriptor::new(EventType::VmcallInstructionExecution), vec![action]).unwrap();

        let mut vcpu = crate::intel::vcpu::VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        for _ in 0..5 {
            trigger_events(&mut ctx, EventType::VmcallInstructionExecution, EventStage::Pre, 0, &|_| true);
        }
        assert_eq!(ctx.registers.rax, 2);
    }
}
