//! Hidden hooks built on EPT.
//!
//! A page with execution hooks has two views. Instruction fetches go to a shadow copy that holds
//! the patches (an `int3` for breakpoint hooks, a `vmcall` for detours) and reads or writes go to
//! the untouched original. The page rests in the execute-only shadow view; a data access raises
//! an EPT violation, runs one instruction on the original page under MTF and returns to the
//! shadow view.
//!
//! Monitor hooks remove rights from the original page instead. The violation they raise triggers
//! the events of the monitored range and the access then completes the same way.

use {
    crate::{
        debugger::{
            disassembler,
            events::{trigger, EventStage, EventType},
        },
        error::HypervisorError,
        intel::{
            ept::{page_align, paging::Ept, AccessType, EptEntry, PAGE_SIZE},
            vcpu::DeferredPostEvent,
            vmexit::VmExitContext,
        },
        memory::{
            mapper,
            pool::{PoolBlock, PoolIntention},
        },
        platform::Platform,
        CoreState,
    },
    alloc::{collections::BTreeMap, vec, vec::Vec},
    iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Instruction, InstructionBlock},
    spin::Mutex,
};

const INT3: u8 = 0xCC;

/// Written over the first relocated instruction of a detour.
const VMCALL: [u8; 3] = [0x0F, 0x01, 0xC1];

/// A detour relocates whole instructions until it covers this many bytes or the code ends.
const MIN_RELOCATION: usize = 5;

/// Lowest address of the kernel half of the address space.
const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// `jmp qword ptr [rip]`, followed by the absolute target.
const ABSOLUTE_JMP: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecHookKind {
    /// The shadow view holds `int3`.
    Breakpoint,
    /// The shadow view holds `vmcall`; the relocated instructions run from the trampoline.
    Detour { trampoline: PoolBlock, relocated_len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHook {
    pub va: u64,
    pub pa: u64,
    pub kind: ExecHookKind,
    /// Every event attached to this address.
    pub tags: Vec<u64>,
}

/// A monitored range as it applies to one page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub tag: u64,
    /// Rights whose use triggers the event.
    pub access: AccessType,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    /// Virtual address of the page in the hooking address space.
    pub page_va: u64,
}

/// Everything hooked on one 4KB guest page.
#[derive(Debug, Clone)]
pub struct HookedPage {
    pub pa: u64,
    pub cr3: u64,
    /// The 4KB EPT entry before the first hook.
    pub original: EptEntry,
    pub shadow: Option<PoolBlock>,
    pub exec_hooks: Vec<ExecHook>,
    pub monitors: Vec<Monitor>,
}

impl HookedPage {
    fn new(pa: u64, cr3: u64, original: EptEntry) -> Self {
        Self { pa, cr3, original, shadow: None, exec_hooks: Vec::new(), monitors: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.exec_hooks.is_empty() && self.monitors.is_empty()
    }

    /// Rights taken away by the monitors. Write without read is not a valid EPT combination, so
    /// a read monitor also takes the write right.
    fn removed_access(&self) -> AccessType {
        let mut removed = self.monitors.iter().fold(AccessType::empty(), |acc, monitor| acc | monitor.access);
        if removed.contains(AccessType::READ) {
            removed |= AccessType::WRITE;
        }
        removed
    }

    /// Host page and rights the page rests in between accesses.
    fn resting(&self) -> (u64, AccessType) {
        match self.shadow {
            Some(shadow) => (shadow.pa(), AccessType::EXECUTE),
            None => (self.pa, AccessType::READ_WRITE_EXECUTE - self.removed_access()),
        }
    }
}

/// Every hooked page, keyed by its guest physical address.
#[derive(Default)]
pub struct HookManager {
    pages: Mutex<BTreeMap<u64, HookedPage>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_hooked(&self, pa: u64) -> bool {
        self.pages.lock().contains_key(&page_align(pa))
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// A copy of the record of the page containing `pa`.
    pub fn page(&self, pa: u64) -> Option<HookedPage> {
        self.pages.lock().get(&page_align(pa)).cloned()
    }
}

/// Takes a page-sized block, reserving one first when the caller is not in VMX root.
fn take_page(platform: &dyn Platform, state: &CoreState, intention: PoolIntention) -> Result<PoolBlock, HypervisorError> {
    if let Ok(block) = state.pool.allocate(intention, PAGE_SIZE as usize) {
        return Ok(block);
    }

    if state.resources.is_in_root(platform.current_core()) {
        log::warn!("{:?} pool is empty, requesting a refill", intention);
        state.pool.request_allocation(PAGE_SIZE as usize, 1, intention);
        return Err(HypervisorError::OutOfPool);
    }

    state.pool.reserve(platform, PAGE_SIZE as usize, 1, intention)?;
    state.pool.allocate(intention, PAGE_SIZE as usize)
}

fn apply_resting(platform: &dyn Platform, ept: &mut Ept, page: &HookedPage) -> Result<(), HypervisorError> {
    let (host_pa, access) = page.resting();
    ept.remap_page(platform, page.pa, host_pa, access)?;
    Ok(())
}

struct Relocation {
    instructions: Vec<Instruction>,
    len: usize,
}

/// Picks the instructions a detour moves to its trampoline. `code` runs to the end of the page,
/// so an instruction that crosses it fails to decode and the hook is refused.
fn relocate(code: &[u8], ip: u64) -> Result<Relocation, HypervisorError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < MIN_RELOCATION && decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            log::warn!("Cannot relocate the instruction at {:#x}", instruction.ip());
            return Err(HypervisorError::HookInstallFailed);
        }

        len += instruction.len();
        let ends_flow = disassembler::ends_flow(&instruction);
        instructions.push(instruction);
        if ends_flow {
            break;
        }
    }

    if len < VMCALL.len() {
        return Err(HypervisorError::HookInstallFailed);
    }

    Ok(Relocation { instructions, len })
}

/// The relocated instructions re-encoded for `trampoline_va`, followed by a jump to `resume`.
fn encode_trampoline(instructions: &[Instruction], trampoline_va: u64, resume: u64) -> Result<Vec<u8>, HypervisorError> {
    let block = InstructionBlock::new(instructions, trampoline_va);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE).map_err(|error| {
        log::warn!("Cannot encode trampoline: {}", error);
        HypervisorError::HookInstallFailed
    })?;

    let mut code = encoded.code_buffer;
    code.extend_from_slice(&ABSOLUTE_JMP);
    code.extend_from_slice(&resume.to_le_bytes());
    Ok(code)
}

/// Builds the patch of a new execution hook. Blocks taken from the pool are pushed to `taken` so
/// that the caller can return them on failure.
fn build_exec_hook(
    platform: &dyn Platform,
    state: &CoreState,
    original_page: &[u8],
    shadow: Option<PoolBlock>,
    va: u64,
    offset: usize,
    detour: bool,
    taken: &mut Vec<PoolBlock>,
) -> Result<(PoolBlock, ExecHookKind), HypervisorError> {
    let shadow = match shadow {
        Some(shadow) => shadow,
        None => {
            let shadow = take_page(platform, state, PoolIntention::ShadowPage)?;
            taken.push(shadow);
            mapper::write_physical(platform, shadow.pa(), original_page)?;
            shadow
        }
    };

    if !detour {
        mapper::write_physical(platform, shadow.pa() + offset as u64, &[INT3])?;
        return Ok((shadow, ExecHookKind::Breakpoint));
    }

    let relocation = relocate(&original_page[offset..], va)?;
    let trampoline = take_page(platform, state, PoolIntention::ShadowPage)?;
    taken.push(trampoline);

    let code = encode_trampoline(&relocation.instructions, trampoline.va(), va + relocation.len as u64)?;
    mapper::write_physical(platform, trampoline.pa(), &code)?;

    let mut patch = vec![INT3; relocation.len];
    patch[..VMCALL.len()].copy_from_slice(&VMCALL);
    mapper::write_physical(platform, shadow.pa() + offset as u64, &patch)?;

    Ok((shadow, ExecHookKind::Detour { trampoline, relocated_len: relocation.len }))
}

fn install_exec_hook(platform: &dyn Platform, state: &CoreState, cr3: u64, va: u64, tag: u64, detour: bool) -> Result<(), HypervisorError> {
    let pa = mapper::virtual_to_physical(platform, cr3, va)?;
    let page_pa = page_align(pa);
    let offset = (pa - page_pa) as usize;

    let mut pages = state.hooks.pages.lock();
    if let Some(page) = pages.get_mut(&page_pa) {
        if let Some(hook) = page.exec_hooks.iter_mut().find(|hook| hook.pa == pa) {
            if matches!(hook.kind, ExecHookKind::Detour { .. }) != detour {
                log::warn!("{:#x} already carries a different kind of hook", va);
                return Err(HypervisorError::HookInstallFailed);
            }
            if !hook.tags.contains(&tag) {
                hook.tags.push(tag);
            }
            log::info!("Event {:#x} attached to the hook at {:#x}", tag, va);
            return Ok(());
        }

        if page.monitors.iter().any(|monitor| monitor.access.contains(AccessType::EXECUTE)) {
            log::warn!("The page of {:#x} is monitored for execution", va);
            return Err(HypervisorError::HookInstallFailed);
        }
    }

    let mut original_page = vec![0u8; PAGE_SIZE as usize];
    mapper::read_physical(platform, page_pa, &mut original_page)?;

    let mut ept = state.ept.lock();
    let was_split = ept.is_split(page_pa);
    if let Err(error) = ept.split_2mb(platform, page_pa) {
        log::warn!("Cannot split the page of {:#x}: {}", va, error);
        return Err(HypervisorError::HookInstallFailed);
    }

    let existing = pages.get(&page_pa).map(|page| (page.shadow, page.original));
    let original = match existing {
        Some((_, original)) => original,
        None => ept.entry(page_pa).ok_or(HypervisorError::HookInstallFailed)?,
    };

    let mut taken = Vec::new();
    let built = build_exec_hook(platform, state, &original_page, existing.and_then(|(shadow, _)| shadow), va, offset, detour, &mut taken);
    let (shadow, kind) = match built {
        Ok(built) => built,
        Err(error) => {
            for block in taken {
                state.pool.free(platform, block);
            }
            if !was_split {
                ept.try_merge_2mb(page_pa);
            }
            return Err(error);
        }
    };

    let page = pages.entry(page_pa).or_insert_with(|| HookedPage::new(page_pa, cr3, original));
    page.shadow = Some(shadow);
    page.exec_hooks.push(ExecHook { va, pa, kind, tags: vec![tag] });
    apply_resting(platform, &mut ept, page)?;
    ept.invalidate(platform);

    drop(ept);
    drop(pages);

    if let Err(error) = state.resources.synchronize(platform) {
        log::warn!("Withdrawing the hook at {:#x}: {}", va, error);
        withdraw(platform, state, |page, retired| page.pa == page_pa && drop_unused_exec_hooks(platform, page, retired, |hook| hook.pa == pa));
        return Err(error);
    }

    log::info!("Installed {} hook at {:#x} (pa {:#x}) for event {:#x}", if detour { "detour" } else { "breakpoint" }, va, pa, tag);
    Ok(())
}

/// Installs an invisible `int3` at `va`: fetches see the breakpoint, reads see the original byte.
pub fn install_cc_hook(platform: &dyn Platform, state: &CoreState, cr3: u64, va: u64, tag: u64) -> Result<(), HypervisorError> {
    install_exec_hook(platform, state, cr3, va, tag, false)
}

/// Installs an invisible detour at `va`. The relocated instructions run from a trampoline unless
/// an event short-circuits them.
///
/// The trampoline lives in system space, so only kernel code can be detoured.
pub fn install_detour_hook(platform: &dyn Platform, state: &CoreState, cr3: u64, va: u64, tag: u64) -> Result<(), HypervisorError> {
    if va < KERNEL_SPACE_START {
        log::warn!("Cannot detour the user-mode address {:#x}", va);
        return Err(HypervisorError::HookInstallFailed);
    }
    install_exec_hook(platform, state, cr3, va, tag, true)
}

/// Monitors `[start, end)` for the accesses in `access`.
///
/// # Arguments
///
/// * `platform` - The platform used to walk the guest page tables.
/// * `state` - The engine state holding the EPT.
/// * `cr3` - Address space of the range.
/// * `start` - First monitored virtual address.
/// * `end` - End of the range, exclusive.
/// * `access` - Rights whose use triggers the event.
/// * `tag` - The event to trigger.
pub fn install_monitor(
    platform: &dyn Platform,
    state: &CoreState,
    cr3: u64,
    start: u64,
    end: u64,
    access: AccessType,
    tag: u64,
) -> Result<(), HypervisorError> {
    if end <= start || access.is_empty() {
        return Err(HypervisorError::BadEventDescriptor);
    }

    let mut targets = Vec::new();
    let mut page_va = start & !(PAGE_SIZE - 1);
    while page_va < end {
        let pa = mapper::virtual_to_physical(platform, cr3, page_va)?;
        targets.push((page_va, page_align(pa)));
        page_va += PAGE_SIZE;
    }

    let mut pages = state.hooks.pages.lock();
    if access.contains(AccessType::EXECUTE)
        && targets.iter().any(|(_, pa)| pages.get(pa).is_some_and(|page| !page.exec_hooks.is_empty()))
    {
        log::warn!("Cannot monitor execution of a page with execution hooks");
        return Err(HypervisorError::HookInstallFailed);
    }

    let mut ept = state.ept.lock();
    let mut newly_split = Vec::new();
    for (_, pa) in &targets {
        if ept.is_split(*pa) {
            continue;
        }
        if let Err(error) = ept.split_2mb(platform, *pa) {
            log::warn!("Cannot split the page at {:#x}: {}", pa, error);
            for split in newly_split {
                ept.try_merge_2mb(split);
            }
            return Err(HypervisorError::HookInstallFailed);
        }
        newly_split.push(*pa);
    }

    for (page_va, pa) in targets {
        let original = match pages.get(&pa) {
            Some(page) => page.original,
            None => ept.entry(pa).ok_or(HypervisorError::HookInstallFailed)?,
        };
        let page = pages.entry(pa).or_insert_with(|| HookedPage::new(pa, cr3, original));
        page.monitors.push(Monitor { tag, access, start, end, page_va });
        apply_resting(platform, &mut ept, page)?;
    }
    ept.invalidate(platform);

    drop(ept);
    drop(pages);

    if let Err(error) = state.resources.synchronize(platform) {
        log::warn!("Withdrawing the monitor on {:#x}..{:#x}: {}", start, end, error);
        withdraw(platform, state, |page, _| {
            let before = page.monitors.len();
            page.monitors.retain(|monitor| !(monitor.tag == tag && monitor.start == start && monitor.end == end && monitor.access == access));
            before != page.monitors.len()
        });
        return Err(error);
    }

    log::info!("Monitoring {:#x}..{:#x} for {:?} (event {:#x})", start, end, access, tag);
    Ok(())
}

/// Detaches hooks from their pages. `detach` edits one page and returns whether it changed.
///
/// Pages left without hooks get their original entry back; shadow pages and trampolines return
/// to the pool once every processor has flushed its EPT translations.
fn remove_where(
    platform: &dyn Platform,
    state: &CoreState,
    mut detach: impl FnMut(&mut HookedPage, &mut Vec<PoolBlock>) -> bool,
) -> Result<usize, HypervisorError> {
    let mut retired = Vec::new();
    let mut changed = 0;

    {
        let mut pages = state.hooks.pages.lock();
        let mut ept = state.ept.lock();
        let mut emptied = Vec::new();

        for page in pages.values_mut() {
            if !detach(page, &mut retired) {
                continue;
            }
            changed += 1;

            if page.exec_hooks.is_empty() {
                if let Some(shadow) = page.shadow.take() {
                    retired.push(shadow);
                }
            }

            if page.is_empty() {
                ept.restore_entry(page.pa, page.original)?;
                emptied.push(page.pa);
            } else {
                apply_resting(platform, &mut ept, page)?;
            }
        }

        for pa in emptied {
            pages.remove(&pa);
            ept.try_merge_2mb(pa);
        }

        if changed > 0 {
            ept.invalidate(platform);
        }
    }

    if changed > 0 {
        let generation = state.resources.request_synchronization(platform);
        for block in retired {
            state.pool.free_after(block, generation);
        }
    }

    Ok(changed)
}

/// Takes back a hook whose installation could not complete.
fn withdraw(platform: &dyn Platform, state: &CoreState, detach: impl FnMut(&mut HookedPage, &mut Vec<PoolBlock>) -> bool) {
    if let Err(error) = remove_where(platform, state, detach) {
        log::error!("Could not withdraw a partially installed hook: {}", error);
    }
}

/// Detaches `tag` from every hook. Hooks left without events are removed. Returns the number of
/// pages that changed.
pub fn remove_hooks_of_event(platform: &dyn Platform, state: &CoreState, tag: u64) -> Result<usize, HypervisorError> {
    let changed = remove_where(platform, state, |page, retired| {
        let monitors = page.monitors.len();
        page.monitors.retain(|monitor| monitor.tag != tag);

        let mut changed = monitors != page.monitors.len();
        for hook in page.exec_hooks.iter_mut() {
            let before = hook.tags.len();
            hook.tags.retain(|hook_tag| *hook_tag != tag);
            changed |= before != hook.tags.len();
        }

        changed | drop_unused_exec_hooks(platform, page, retired, |hook| hook.tags.is_empty())
    })?;

    log::debug!("Removed event {:#x} from {} hooked pages", tag, changed);
    Ok(changed)
}

/// Removes every hook at `va`, whatever event it belongs to.
pub fn remove_hook_at(platform: &dyn Platform, state: &CoreState, cr3: u64, va: u64) -> Result<(), HypervisorError> {
    let pa = mapper::virtual_to_physical(platform, cr3, va)?;

    let changed = remove_where(platform, state, |page, retired| {
        if page.pa != page_align(pa) {
            return false;
        }

        let monitors = page.monitors.len();
        page.monitors.retain(|monitor| !(monitor.start <= va && va < monitor.end));
        let changed = monitors != page.monitors.len();

        changed | drop_unused_exec_hooks(platform, page, retired, |hook| hook.pa == pa)
    })?;

    match changed {
        0 => Err(HypervisorError::TagNotFound),
        _ => Ok(()),
    }
}

/// Removes the execution hooks selected by `remove` and puts the original bytes back in the
/// shadow page.
fn drop_unused_exec_hooks(platform: &dyn Platform, page: &mut HookedPage, retired: &mut Vec<PoolBlock>, remove: impl Fn(&ExecHook) -> bool) -> bool {
    let (removed, kept): (Vec<ExecHook>, Vec<ExecHook>) = page.exec_hooks.drain(..).partition(|hook| remove(hook));
    page.exec_hooks = kept;

    for hook in &removed {
        let len = match hook.kind {
            ExecHookKind::Breakpoint => 1,
            ExecHookKind::Detour { trampoline, relocated_len } => {
                retired.push(trampoline);
                relocated_len
            }
        };

        if let Some(shadow) = page.shadow {
            let offset = hook.pa - page.pa;
            let mut original = vec![0u8; len];
            if mapper::read_physical(platform, hook.pa, &mut original).is_err()
                || mapper::write_physical(platform, shadow.pa() + offset, &original).is_err()
            {
                log::warn!("Could not restore the shadow bytes at {:#x}", hook.va);
            }
        }
    }

    !removed.is_empty()
}

/// Runs the current instruction against the original page, then returns the page to its resting
/// view on the MTF exit.
fn step_on_original(ctx: &mut VmExitContext<'_>, page_pa: u64) {
    let restored = ctx.state.hooks.pages.lock().get(&page_pa).map(|page| {
        let mut ept = ctx.state.ept.lock();
        let result = ept.restore_entry(page_pa, page.original);
        ept.invalidate(ctx.platform);
        result
    });

    match restored {
        Some(Ok(())) => {
            if !ctx.vcpu.pending_ept_restore.contains(&page_pa) {
                ctx.vcpu.pending_ept_restore.push(page_pa);
            }
            ctx.vcpu.set_monitor_trap_flag(ctx.platform, true);
        }
        Some(Err(error)) => log::error!("Could not open the original view of {:#x}: {}", page_pa, error),
        None => log::trace!("Page {:#x} was unhooked meanwhile", page_pa),
    }
}

/// Puts the pages opened by [`step_on_original`] back in their resting view. Called on the MTF
/// exit that follows the step.
pub fn restore_resting(ctx: &mut VmExitContext<'_>) {
    if ctx.vcpu.pending_ept_restore.is_empty() {
        return;
    }

    let pages = ctx.state.hooks.pages.lock();
    let mut ept = ctx.state.ept.lock();
    for page_pa in ctx.vcpu.pending_ept_restore.drain(..) {
        if let Some(page) = pages.get(&page_pa) {
            if let Err(error) = apply_resting(ctx.platform, &mut ept, page) {
                log::error!("Could not restore hook view of {:#x}: {}", page_pa, error);
            }
        }
    }
    ept.invalidate(ctx.platform);
}

fn exec_hook_at(ctx: &VmExitContext<'_>, rip: u64) -> Option<(u64, ExecHook)> {
    let pa = mapper::virtual_to_physical(ctx.platform, ctx.guest_cr3(), rip).ok()?;
    let page_pa = page_align(pa);
    let pages = ctx.state.hooks.pages.lock();
    let hook = pages.get(&page_pa)?.exec_hooks.iter().find(|hook| hook.pa == pa)?.clone();
    Some((page_pa, hook))
}

/// Handles the #BP of a hidden breakpoint hook. Returns false when the `int3` is not ours.
pub fn handle_breakpoint(ctx: &mut VmExitContext<'_>) -> bool {
    let rip = ctx.registers.rip;
    let Some((page_pa, hook)) = exec_hook_at(ctx, rip) else {
        return false;
    };
    if hook.kind != ExecHookKind::Breakpoint {
        return false;
    }

    log::trace!("Hidden breakpoint hit at {:#x}", rip);
    ctx.vcpu.suppress_rip_increment();

    let outcome = trigger::dispatch(ctx, EventType::HiddenHookExecCc, rip, &|event| hook.tags.contains(&event.tag), |ctx| {
        step_on_original(ctx, page_pa)
    });

    if outcome.short_circuit {
        skip_instruction(ctx, rip);
    }

    true
}

/// Handles the `vmcall` of a detour. Returns false when the `vmcall` is not ours.
pub fn handle_detour(ctx: &mut VmExitContext<'_>) -> bool {
    let rip = ctx.registers.rip;
    let Some((_, hook)) = exec_hook_at(ctx, rip) else {
        return false;
    };
    let ExecHookKind::Detour { trampoline, relocated_len } = hook.kind else {
        return false;
    };

    log::trace!("Detour hit at {:#x}", rip);
    ctx.vcpu.suppress_rip_increment();

    let outcome = trigger::dispatch(ctx, EventType::HiddenHookExecDetours, rip, &|event| hook.tags.contains(&event.tag), |ctx| {
        ctx.registers.rip = trampoline.va()
    });

    if outcome.short_circuit {
        ctx.registers.rip = rip + relocated_len as u64;
    }

    true
}

/// Moves RIP past the instruction at `rip` without executing it.
fn skip_instruction(ctx: &mut VmExitContext<'_>, rip: u64) {
    let bytes = disassembler::guest_instruction_bytes(ctx.platform, ctx.guest_cr3(), rip);
    let bitness = disassembler::guest_bitness(ctx.platform);
    match disassembler::instruction_length(&bytes, bitness) {
        Some(len) => ctx.registers.rip = rip + len as u64,
        None => log::warn!("Cannot skip the undecodable instruction at {:#x}", rip),
    }
}

/// Handles an EPT violation on a hooked page. Returns false when the page is not hooked.
///
/// Monitors whose range contains the access and whose rights include it trigger their events;
/// the access then runs once against the original page.
///
/// # Arguments
///
/// * `ctx` - The current VM exit.
/// * `gpa` - Guest physical address of the access.
/// * `attempted` - The kind of access.
pub fn handle_ept_violation(ctx: &mut VmExitContext<'_>, gpa: u64, attempted: AccessType) -> bool {
    let page_pa = page_align(gpa);
    let Some(page) = ctx.state.hooks.page(page_pa) else {
        return false;
    };

    ctx.vcpu.suppress_rip_increment();

    let va = page.monitors.first().map(|monitor| monitor.page_va).unwrap_or(0) + (gpa - page_pa);
    let triggered: Vec<u64> = page
        .monitors
        .iter()
        .filter(|monitor| monitor.access.intersects(attempted) && monitor.start <= va && va < monitor.end)
        .map(|monitor| monitor.tag)
        .collect();

    let rip = ctx.registers.rip;
    let mut short_circuit = false;
    for tag in triggered {
        let Some(event) = ctx.state.events.find(tag) else {
            continue;
        };

        let outcome = trigger::trigger_events(ctx, event.event_type, EventStage::Pre, va, &|candidate| candidate.tag == tag);
        short_circuit |= outcome.short_circuit;
        if outcome.post_event_required {
            ctx.vcpu.deferred_post_events.push(DeferredPostEvent { tag, event_type: event.event_type, context: va });
        }
    }

    if short_circuit {
        ctx.vcpu.deferred_post_events.clear();
        skip_instruction(ctx, rip);
        return true;
    }

    step_on_original(ctx, page_pa);
    true
}

/// Runs the post stage of monitors whose access has now completed.
pub fn trigger_deferred_post_events(ctx: &mut VmExitContext<'_>) {
    let deferred = core::mem::take(&mut ctx.vcpu.deferred_post_events);
    for post in deferred {
        trigger::trigger_events(ctx, post.event_type, EventStage::Post, post.context, &|event| event.tag == post.tag);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            debugger::events::tests::setup,
            intel::{registers::GuestRegisters, vcpu::VcpuState},
        },
        x86::vmx::vmcs::guest,
    };

    const CODE: [u8; 8] = [0x48, 0x89, 0xC8, 0xC3, 0x90, 0x90, 0x90, 0x90];
    const KERNEL_CODE: u64 = 0xFFFF_F800_0000_2000;

    fn fetch(platform: &dyn Platform, state: &CoreState, pa: u64, len: usize) -> Vec<u8> {
        let host_pa = state.ept.lock().translate(pa, AccessType::EXECUTE).unwrap();
        let mut bytes = vec![0u8; len];
        mapper::read_physical(platform, host_pa, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_breakpoint_hook_is_invisible_to_reads() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x2000, &CODE)[0];
        let before = state.ept.lock().entry(pa);

        install_cc_hook(&platform, &state, cr3, 0x2000, 7).unwrap();

        assert_eq!(fetch(&platform, &state, pa, 2), [0xCC, 0x89]);
        assert!(state.ept.lock().translate(pa, AccessType::READ).is_err());
        assert_eq!(platform.read_memory(pa, 4), CODE[..4]);

        // A second event on the same address shares the hook.
        install_cc_hook(&platform, &state, cr3, 0x2000, 8).unwrap();
        assert_eq!(state.hooks.page(pa).unwrap().exec_hooks[0].tags, [7, 8]);
        assert_eq!(install_detour_hook(&platform, &state, cr3, 0x2000, 9), Err(HypervisorError::HookInstallFailed));

        remove_hooks_of_event(&platform, &state, 7).unwrap();
        assert!(state.hooks.is_hooked(pa));
        remove_hooks_of_event(&platform, &state, 8).unwrap();
        assert!(!state.hooks.is_hooked(pa));

        assert_eq!(state.ept.lock().entry(pa), before);
        assert_eq!(state.pool.retired(), 1);
    }

    #[test]
    fn test_detour_builds_trampoline() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, KERNEL_CODE, &CODE)[0];

        install_detour_hook(&platform, &state, cr3, KERNEL_CODE, 1).unwrap();

        // `mov rax, rcx; ret` is relocated whole: the ret ends the flow before five bytes.
        assert_eq!(fetch(&platform, &state, pa, 5), [0x0F, 0x01, 0xC1, 0xCC, 0x90]);

        let page = state.hooks.page(pa).unwrap();
        let ExecHookKind::Detour { trampoline, relocated_len } = page.exec_hooks[0].kind else {
            panic!("not a detour");
        };
        assert_eq!(relocated_len, 4);
        assert_eq!(platform.read_memory(trampoline.pa(), 6), [0x48, 0x89, 0xC8, 0xC3, 0xFF, 0x25]);
    }

    #[test]
    fn test_hook_crossing_page_end_is_refused() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        // `mov rax, imm64` starting two bytes before the end of the page.
        let frames = platform.map_bytes(cr3, KERNEL_CODE + 0xFFE, &[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]);
        let before = state.ept.lock().entry(frames[0]);

        assert_eq!(install_detour_hook(&platform, &state, cr3, KERNEL_CODE + 0xFFE, 1), Err(HypervisorError::HookInstallFailed));
        assert!(state.hooks.is_empty());
        assert_eq!(state.ept.lock().entry(frames[0]), before);
    }

    #[test]
    fn test_monitor_violation_steps_on_original() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x5000, &[0u8; 16])[0];
        platform.set_vmcs(guest::CR3, cr3);

        install_monitor(&platform, &state, cr3, 0x5008, 0x5010, AccessType::WRITE, 3).unwrap();
        assert!(state.ept.lock().translate(pa, AccessType::READ).is_ok());
        assert!(state.ept.lock().translate(pa + 8, AccessType::WRITE).is_err());

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters::default();
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_ept_violation(&mut ctx, pa + 8, AccessType::WRITE));
        assert_eq!(ctx.vcpu.pending_ept_restore, [pa]);
        assert!(state.ept.lock().translate(pa + 8, AccessType::WRITE).is_ok());

        restore_resting(&mut ctx);
        assert!(ctx.vcpu.pending_ept_restore.is_empty());
        assert!(state.ept.lock().translate(pa + 8, AccessType::WRITE).is_err());

        assert!(!handle_ept_violation(&mut ctx, 0x9000, AccessType::WRITE));
        assert_eq!(remove_hook_at(&platform, &state, cr3, 0x5008), Ok(()));
        assert!(state.hooks.is_empty());
    }

    #[test]
    fn test_user_mode_detour_is_refused() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x2000, &CODE)[0];
        let before = state.ept.lock().entry(pa);

        assert_eq!(install_detour_hook(&platform, &state, cr3, 0x2000, 1), Err(HypervisorError::HookInstallFailed));
        assert!(state.hooks.is_empty());
        assert_eq!(state.ept.lock().entry(pa), before);
    }

    #[test]
    fn test_detour_resumes_in_trampoline() {
        let (platform, state) = setup(1);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, KERNEL_CODE, &CODE)[0];
        platform.set_vmcs(guest::CR3, cr3);

        install_detour_hook(&platform, &state, cr3, KERNEL_CODE, 1).unwrap();
        let ExecHookKind::Detour { trampoline, .. } = state.hooks.page(pa).unwrap().exec_hooks[0].kind else {
            panic!("not a detour");
        };

        let mut vcpu = VcpuState::new(0).unwrap();
        let mut registers = GuestRegisters { rip: KERNEL_CODE, ..Default::default() };
        let mut ctx = VmExitContext::new(&platform, &state, &mut vcpu, &mut registers);

        assert!(handle_detour(&mut ctx));
        assert!(!ctx.vcpu.increment_rip);
        assert_eq!(ctx.registers.rip, trampoline.va());

        // A vmcall somewhere else is not a detour.
        ctx.registers.rip = KERNEL_CODE + 4;
        assert!(!handle_detour(&mut ctx));
    }

    #[test]
    fn test_install_waits_for_other_processors() {
        let (platform, state) = setup(2);
        let cr3 = platform.create_address_space();
        let pa = platform.map_bytes(cr3, 0x2000, &CODE)[0];
        let before = state.ept.lock().entry(pa);

        // Processor 1 keeps running the guest and never flushes.
        assert_eq!(install_cc_hook(&platform, &state, cr3, 0x2000, 7), Err(HypervisorError::SynchronizationTimedOut));
        assert!(!state.hooks.is_hooked(pa));
        assert_eq!(state.ept.lock().entry(pa), before);
        assert!(platform.nmis_sent().contains(&1));

        // Parked in VMX root, it flushes before resuming the guest.
        state.resources.enter_root(1);
        install_cc_hook(&platform, &state, cr3, 0x2000, 7).unwrap();
        assert!(state.hooks.is_hooked(pa));
    }
}
