//! Handles CPU-related virtualization tasks, specifically intercepting and managing
//! the `CPUID` instruction in a VM to control the exposure of CPU features to the guest.

use crate::{
    debugger::events::{trigger, Event, EventType, APPLY_TO_ALL_PARAM},
    intel::vmexit::VmExitContext,
};

/// Handles the `CPUID` VM-exit.
///
/// This function is invoked when the guest executes the `CPUID` instruction.
/// `CPUID` events see the leaf as their context. The emulation executes the instruction on the
/// host and lets the transparency layer present or conceal the hypervisor before the result
/// lands in the guest's registers.
///
/// An event with parameter 0 (or the wildcard) watches every leaf; any other event only watches
/// the leaf in its second parameter.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 10.
#[rustfmt::skip]
pub fn handle_cpuid(ctx: &mut VmExitContext<'_>) {
    let leaf = ctx.registers.rax as u32;
    let sub_leaf = ctx.registers.rcx as u32;

    log::trace!("Leaf: {:#x} Sub-leaf: {:#x}", leaf, sub_leaf);

    let matches = |event: &Event| {
        event.params[0] == 0 || event.params[0] == APPLY_TO_ALL_PARAM || event.params[1] == u64::from(leaf)
    };

    trigger::dispatch(ctx, EventType::CpuidInstructionExecution, u64::from(leaf), &matches, |ctx| {
        let mut result = ctx.platform.cpuid(leaf, sub_leaf);
        ctx.state.transparency.adjust_cpuid(leaf, &mut result);

        ctx.registers.rax = u64::from(result.eax);
        ctx.registers.rbx = u64::from(result.ebx);
        ctx.registers.rcx = u64::from(result.ecx);
        ctx.registers.rdx = u64::from(result.edx);
    });
}
