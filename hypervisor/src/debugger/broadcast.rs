//! Work handed to processors parked in VMX root.
//!
//! While every processor is halted, only the processor serving the debugger runs. Anything that
//! must execute on another processor (its registers, its MSRs, its cached EPT translations) is
//! queued in that processor's slot; the parked processor picks it up from its wait loop and
//! leaves the result in the same slot.

use {
    crate::{
        error::HypervisorError,
        intel::{registers::GuestRegisters, vmexit::VmExitContext},
    },
    alloc::{boxed::Box, vec::Vec},
    spin::Mutex,
};

/// Polls of a slot before the requester gives up on a parked processor.
const MAX_TASK_POLLS: u64 = 100_000_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HaltedCoreTask {
    /// Re-applies the interception counts to the VMCS.
    ApplyInterceptions,
    /// Flushes every cached EPT translation.
    InvalidateEpt,
    ReadRegisters,
    ReadMsr(u32),
    WriteMsr(u32, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Done,
    Registers(Box<GuestRegisters>),
    Msr(Option<u64>),
    /// The MSR access raised #GP.
    Faulted,
}

#[derive(Debug, Clone)]
enum TaskSlot {
    Empty,
    Queued(HaltedCoreTask),
    Finished(TaskResult),
}

/// One task slot per processor.
pub struct TaskSlots {
    slots: Vec<Mutex<TaskSlot>>,
}

impl TaskSlots {
    pub fn new(processor_count: u32) -> Self {
        Self { slots: (0..processor_count).map(|_| Mutex::new(TaskSlot::Empty)).collect() }
    }

    /// Runs the task queued for the calling processor, if any.
    pub fn service(&self, ctx: &mut VmExitContext<'_>) {
        let Some(slot) = self.slots.get(ctx.core() as usize) else {
            return;
        };

        let task = match &*slot.lock() {
            TaskSlot::Queued(task) => *task,
            _ => return,
        };

        let result = execute(ctx, task);
        *slot.lock() = TaskSlot::Finished(result);
    }

    /// Runs `task` on processor `core`.
    ///
    /// The calling processor runs it directly. Any other processor must be parked; the call waits
    /// until it has executed the task.
    pub fn run_on(&self, ctx: &mut VmExitContext<'_>, core: u32, task: HaltedCoreTask) -> Result<TaskResult, HypervisorError> {
        if core == ctx.core() {
            return Ok(execute(ctx, task));
        }

        if !ctx.state.session.is_halted(core) {
            return Err(HypervisorError::DebuggerBusy);
        }

        let slot = self.slots.get(core as usize).ok_or(HypervisorError::BadEventDescriptor)?;
        *slot.lock() = TaskSlot::Queued(task);

        for _ in 0..MAX_TASK_POLLS {
            {
                let mut guard = slot.lock();
                if let TaskSlot::Finished(result) = &*guard {
                    let result = result.clone();
                    *guard = TaskSlot::Empty;
                    return Ok(result);
                }
            }
            core::hint::spin_loop();
        }

        log::error!("Processor {} did not pick up {:?}", core, task);
        *slot.lock() = TaskSlot::Empty;
        Err(HypervisorError::DebuggerBusy)
    }

    /// Runs `task` on every processor and returns the results in processor order.
    pub fn run_on_all(&self, ctx: &mut VmExitContext<'_>, task: HaltedCoreTask) -> Vec<(u32, Result<TaskResult, HypervisorError>)> {
        (0..self.slots.len() as u32).map(|core| (core, self.run_on(ctx, core, task))).collect()
    }
}

fn execute(ctx: &mut VmExitContext<'_>, task: HaltedCoreTask) -> TaskResult {
    log::trace!("Processor {} running {:?}", ctx.core(), task);

    match task {
        HaltedCoreTask::ApplyInterceptions => {
            ctx.state.resources.apply(ctx.platform, ctx.vcpu);
            TaskResult::Done
        }
        HaltedCoreTask::InvalidateEpt => {
            ctx.state.ept.lock().invalidate(ctx.platform);
            TaskResult::Done
        }
        HaltedCoreTask::ReadRegisters => TaskResult::Registers(Box::new(ctx.registers.clone())),
        HaltedCoreTask::ReadMsr(msr) => TaskResult::Msr(ctx.platform.rdmsr(msr)),
        HaltedCoreTask::WriteMsr(msr, value) => match ctx.platform.wrmsr(msr, value) {
            true => TaskResult::Done,
            false => TaskResult::Faulted,
        },
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{debugger::events::tests::setup, intel::vcpu::VcpuState},
    };

    #[test]
    fn test_local_tasks_run_directly() {
        let (platform, state) = setup(2);
        platform.set_msr(0x174, 0x10);

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rax: 7, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        let tasks = TaskSlots::new(2);

        assert_eq!(tasks.run_on(&mut ctx, 0, HaltedCoreTask::ReadMsr(0x174)), Ok(TaskResult::Msr(Some(0x10))));
        match tasks.run_on(&mut ctx, 0, HaltedCoreTask::ReadRegisters) {
            Ok(TaskResult::Registers(registers)) => assert_eq!(registers.rax, 7),
            other => panic!("unexpected {:?}", other),
        }

        // Processor 1 is running the guest, not parked.
        assert_eq!(tasks.run_on(&mut ctx, 1, HaltedCoreTask::InvalidateEpt), Err(HypervisorError::DebuggerBusy));
    }

    #[test]
    fn test_queued_task_is_serviced_by_owner() {
        let (platform, state) = setup(2);
        let tasks = TaskSlots::new(2);
        *tasks.slots[1].lock() = TaskSlot::Queued(HaltedCoreTask::WriteMsr(0x175, 0x20));

        platform.set_current_core(1);
        let mut vcpu = VcpuState::new(1).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);
        tasks.service(&mut ctx);

        assert_eq!(platform.msr(0x175), Some(0x20));
        assert!(matches!(&*tasks.slots[1].lock(), TaskSlot::Finished(TaskResult::Done)));
    }
}
