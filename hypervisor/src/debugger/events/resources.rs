//! Per-processor reference counts of interception facilities.
//!
//! Any processor may acquire or release an interception for any other processor, but only the
//! owner may touch its VMCS. Changes therefore only update the counts and mark the target dirty;
//! the target re-applies its controls at its next VM exit. A processor running the guest is
//! kicked with an NMI so that this happens promptly.
//!
//! The same mechanism carries EPT invalidation: [`ResourceController::request_synchronization`]
//! opens a new generation, and every processor executes INVEPT and records the generation on its
//! next exit. Memory that stale translations may still reach is only reused once
//! [`ResourceController::completed_generation`] has passed the generation it was retired at.
//!
//! A requester publishes its change before it looks at the target's in-root mark, and a processor
//! clears that mark before it looks for pending changes. With both sides sequentially consistent,
//! either the requester sees the processor outside VMX root and kicks it, or the processor sees
//! the change before it resumes the guest.

use {
    crate::{
        error::HypervisorError,
        intel::{
            invept::InveptType,
            vcpu::{Interception, VcpuState},
        },
        platform::Platform,
    },
    alloc::{collections::BTreeMap, vec::Vec},
    core::sync::atomic::{AtomicBool, AtomicU64, Ordering},
    spin::Mutex,
};

/// Polling interval while waiting for other processors to flush.
const SYNCHRONIZATION_POLL_US: u64 = 10;

/// How long [`ResourceController::synchronize`] waits, in polling intervals.
const SYNCHRONIZATION_ATTEMPTS: u64 = 100_000;

fn per_core<T>(processor_count: u32, make: impl Fn() -> T) -> Vec<T> {
    (0..processor_count).map(|_| make()).collect()
}

pub struct ResourceController {
    counts: Vec<Mutex<BTreeMap<Interception, u32>>>,
    dirty: Vec<AtomicBool>,
    in_root: Vec<AtomicBool>,
    pending_nmi: Vec<AtomicBool>,
    generation: AtomicU64,
    observed: Vec<AtomicU64>,
}

impl ResourceController {
    pub fn new(processor_count: u32) -> Self {
        Self {
            counts: per_core(processor_count, || Mutex::new(BTreeMap::new())),
            dirty: per_core(processor_count, || AtomicBool::new(false)),
            in_root: per_core(processor_count, || AtomicBool::new(false)),
            pending_nmi: per_core(processor_count, || AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            observed: per_core(processor_count, || AtomicU64::new(0)),
        }
    }

    pub fn processor_count(&self) -> u32 {
        self.counts.len() as u32
    }

    fn check_core(&self, core: u32) -> Result<usize, HypervisorError> {
        let index = core as usize;
        if index >= self.counts.len() {
            return Err(HypervisorError::BadEventDescriptor);
        }
        Ok(index)
    }

    /// Increments the count of `interception` on `core`, enabling it on the 0 -> 1 transition.
    pub fn acquire(&self, platform: &dyn Platform, core: u32, interception: Interception) -> Result<(), HypervisorError> {
        interception.validate()?;
        let index = self.check_core(core)?;

        let enabled = {
            let mut counts = self.counts[index].lock();
            let count = counts.entry(interception).or_insert(0);
            *count += 1;
            *count == 1
        };

        if enabled {
            log::trace!("Processor {}: enabling {:?}", core, interception);
            self.dirty[index].store(true, Ordering::SeqCst);
            self.request_exit(platform, core);
        }

        Ok(())
    }

    /// Decrements the count of `interception` on `core`, disabling it on the 1 -> 0 transition.
    /// Releasing an interception that is not held is a no-op.
    pub fn release(&self, platform: &dyn Platform, core: u32, interception: Interception) {
        let Ok(index) = self.check_core(core) else {
            return;
        };

        let disabled = {
            let mut counts = self.counts[index].lock();
            match counts.get_mut(&interception) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&interception);
                    true
                }
                None => false,
            }
        };

        if disabled {
            log::trace!("Processor {}: disabling {:?}", core, interception);
            self.dirty[index].store(true, Ordering::SeqCst);
            self.request_exit(platform, core);
        }
    }

    /// Acquires on one processor, or on every processor for `None`. On failure nothing stays
    /// acquired.
    pub fn acquire_on(&self, platform: &dyn Platform, core: Option<u32>, interception: Interception) -> Result<(), HypervisorError> {
        let cores: Vec<u32> = match core {
            Some(core) => alloc::vec![core],
            None => (0..self.processor_count()).collect(),
        };

        for (position, core) in cores.iter().enumerate() {
            if let Err(error) = self.acquire(platform, *core, interception) {
                for acquired in &cores[..position] {
                    self.release(platform, *acquired, interception);
                }
                return Err(error);
            }
        }

        Ok(())
    }

    pub fn release_on(&self, platform: &dyn Platform, core: Option<u32>, interception: Interception) {
        match core {
            Some(core) => self.release(platform, core, interception),
            None => (0..self.processor_count()).for_each(|core| self.release(platform, core, interception)),
        }
    }

    pub fn count(&self, core: u32, interception: Interception) -> u32 {
        self.counts
            .get(core as usize)
            .and_then(|counts| counts.lock().get(&interception).copied())
            .unwrap_or(0)
    }

    /// A copy of the active counts of `core`.
    pub fn counts(&self, core: u32) -> BTreeMap<Interception, u32> {
        self.counts.get(core as usize).map(|counts| counts.lock().clone()).unwrap_or_default()
    }

    /// Marks `core` as running a VM-exit handler (or parked in one).
    pub fn enter_root(&self, core: u32) {
        if let Some(flag) = self.in_root.get(core as usize) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Clears the in-root mark of `vcpu`'s processor, applying every change posted up to that
    /// point. Changes posted while the mark was still set were not announced with an NMI, so they
    /// are picked up here before the guest resumes.
    pub fn leave_root(&self, platform: &dyn Platform, vcpu: &mut VcpuState) {
        let index = vcpu.index as usize;
        let Some(flag) = self.in_root.get(index) else {
            return;
        };

        loop {
            self.apply(platform, vcpu);
            flag.store(false, Ordering::SeqCst);
            if !self.has_pending_work(index) {
                return;
            }
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_in_root(&self, core: u32) -> bool {
        self.in_root.get(core as usize).is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn has_pending_work(&self, index: usize) -> bool {
        let dirty = self.dirty.get(index).is_some_and(|dirty| dirty.load(Ordering::SeqCst));
        let stale = self
            .observed
            .get(index)
            .is_some_and(|observed| observed.load(Ordering::SeqCst) < self.generation.load(Ordering::SeqCst));
        dirty || stale
    }

    /// Makes `core` take a VM exit soon. A processor already in VMX root picks the change up
    /// before it resumes the guest.
    pub fn request_exit(&self, platform: &dyn Platform, core: u32) {
        if self.is_in_root(core) {
            return;
        }

        if let Some(pending) = self.pending_nmi.get(core as usize) {
            pending.store(true, Ordering::Release);
            platform.send_nmi(core);
        }
    }

    /// Consumes an NMI that was sent to force an exit. Returns false for an NMI that belongs to
    /// the guest.
    pub fn take_nmi_request(&self, core: u32) -> bool {
        self.pending_nmi
            .get(core as usize)
            .is_some_and(|pending| pending.swap(false, Ordering::AcqRel))
    }

    /// Opens a new invalidation generation and returns it.
    pub fn request_synchronization(&self, platform: &dyn Platform) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (0..self.processor_count()).for_each(|core| self.request_exit(platform, core));
        generation
    }

    /// Opens a new invalidation generation and waits until no processor can still run the guest
    /// with translations older than it.
    ///
    /// The calling processor flushes right away. Another processor counts as done once it has
    /// recorded the generation, or while it is in VMX root, since it flushes before it resumes
    /// the guest.
    pub fn synchronize(&self, platform: &dyn Platform) -> Result<u64, HypervisorError> {
        let generation = self.request_synchronization(platform);

        let current = platform.current_core();
        if let Some(observed) = self.observed.get(current as usize) {
            platform.invept(InveptType::AllContexts, 0);
            observed.fetch_max(generation, Ordering::SeqCst);
        }

        for _ in 0..SYNCHRONIZATION_ATTEMPTS {
            let lagging = (0..self.processor_count())
                .filter(|core| *core != current)
                .find(|core| self.observed[*core as usize].load(Ordering::SeqCst) < generation && !self.is_in_root(*core));

            let Some(core) = lagging else {
                return Ok(generation);
            };
            log::trace!("Waiting for processor {} to reach generation {}", core, generation);
            platform.microsleep(SYNCHRONIZATION_POLL_US);
        }

        log::error!("Processors did not flush their EPT translations for generation {}", generation);
        Err(HypervisorError::SynchronizationTimedOut)
    }

    /// The newest generation every processor has passed.
    pub fn completed_generation(&self) -> u64 {
        self.observed
            .iter()
            .map(|observed| observed.load(Ordering::Acquire))
            .min()
            .unwrap_or(0)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Brings the VMCS of the calling processor up to date. Must run on `vcpu`'s own processor
    /// in VMX root.
    pub fn apply(&self, platform: &dyn Platform, vcpu: &mut VcpuState) {
        let index = vcpu.index as usize;
        let (Some(dirty), Some(observed)) = (self.dirty.get(index), self.observed.get(index)) else {
            return;
        };

        if dirty.swap(false, Ordering::SeqCst) {
            let counts = self.counts(vcpu.index);
            vcpu.apply_interceptions(platform, &counts);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        if observed.load(Ordering::SeqCst) < generation {
            platform.invept(InveptType::AllContexts, 0);
            observed.fetch_max(generation, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::platform::mock::MockPlatform,
        proptest::prelude::*,
        x86::vmx::vmcs::control,
    };

    #[test]
    fn test_transitions_flip_vmcs_once() {
        let platform = crate::tests::permissive_platform(1);
        let controller = ResourceController::new(1);
        let mut vcpu = VcpuState::new(0).unwrap();

        controller.acquire(&platform, 0, Interception::Exception(Some(3))).unwrap();
        controller.acquire(&platform, 0, Interception::Exception(Some(3))).unwrap();
        assert_eq!(platform.nmis_sent(), [0]);
        assert!(controller.take_nmi_request(0));
        assert!(!controller.take_nmi_request(0));

        controller.apply(&platform, &mut vcpu);
        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 1 << 3);

        controller.release(&platform, 0, Interception::Exception(Some(3)));
        controller.apply(&platform, &mut vcpu);
        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 1 << 3);

        controller.release(&platform, 0, Interception::Exception(Some(3)));
        controller.apply(&platform, &mut vcpu);
        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 0);
    }

    #[test]
    fn test_no_nmi_while_in_root() {
        let platform = crate::tests::permissive_platform(2);
        let controller = ResourceController::new(2);

        controller.enter_root(1);
        controller.acquire(&platform, 1, Interception::RdtscExiting).unwrap();
        assert!(platform.nmis_sent().is_empty());

        let mut vcpu = VcpuState::new(1).unwrap();
        controller.leave_root(&platform, &mut vcpu);
        controller.release(&platform, 1, Interception::RdtscExiting);
        assert_eq!(platform.nmis_sent(), [1]);
    }

    #[test]
    fn test_change_posted_in_root_is_applied_on_leave() {
        let platform = crate::tests::permissive_platform(1);
        let controller = ResourceController::new(1);
        let mut vcpu = VcpuState::new(0).unwrap();

        controller.enter_root(0);
        controller.apply(&platform, &mut vcpu);
        controller.acquire(&platform, 0, Interception::Exception(Some(3))).unwrap();
        let generation = controller.request_synchronization(&platform);
        assert!(platform.nmis_sent().is_empty());

        controller.leave_root(&platform, &mut vcpu);
        assert!(!controller.is_in_root(0));
        assert_eq!(platform.vmcs(control::EXCEPTION_BITMAP), 1 << 3);
        assert_eq!(controller.completed_generation(), generation);
    }

    #[test]
    fn test_synchronize_waits_for_running_cores() {
        let platform = crate::tests::permissive_platform(2);
        let controller = ResourceController::new(2);

        // Processor 1 is parked in VMX root and flushes before it resumes.
        controller.enter_root(1);
        assert_eq!(controller.synchronize(&platform), Ok(1));
        assert_eq!(controller.completed_generation(), 0);

        let mut vcpu = VcpuState::new(1).unwrap();
        controller.leave_root(&platform, &mut vcpu);
        assert_eq!(controller.completed_generation(), 1);

        // Processor 1 now runs the guest and never exits.
        assert_eq!(controller.synchronize(&platform), Err(HypervisorError::SynchronizationTimedOut));
        assert!(platform.nmis_sent().contains(&1));
        assert!(platform.microseconds_slept() >= SYNCHRONIZATION_POLL_US * SYNCHRONIZATION_ATTEMPTS);
    }

    #[test]
    fn test_acquire_on_all_rolls_back() {
        let platform = MockPlatform::new(2);
        let controller = ResourceController::new(2);

        assert_eq!(
            controller.acquire_on(&platform, None, Interception::CrRead(0)),
            Err(HypervisorError::CouldNotActivateInterception)
        );
        assert_eq!(controller.acquire_on(&platform, Some(5), Interception::RdtscExiting), Err(HypervisorError::BadEventDescriptor));

        controller.acquire_on(&platform, None, Interception::RdpmcExiting).unwrap();
        assert_eq!(controller.count(0, Interception::RdpmcExiting), 1);
        assert_eq!(controller.count(1, Interception::RdpmcExiting), 1);
    }

    #[test]
    fn test_generation_completes_after_every_core_applies() {
        let platform = crate::tests::permissive_platform(2);
        let controller = ResourceController::new(2);
        let mut first = VcpuState::new(0).unwrap();
        let mut second = VcpuState::new(1).unwrap();

        let generation = controller.request_synchronization(&platform);
        assert_eq!(generation, 1);
        assert_eq!(controller.completed_generation(), 0);

        controller.apply(&platform, &mut first);
        assert_eq!(controller.completed_generation(), 0);
        controller.apply(&platform, &mut second);
        assert_eq!(controller.completed_generation(), 1);
        assert_eq!(platform.invept_count(), 2);
    }

    proptest! {
        #[test]
        fn test_balanced_sequences_leave_nothing_enabled(ops in proptest::collection::vec((0u8..3, any::<bool>()), 0..64)) {
            let platform = MockPlatform::new(1);
            let controller = ResourceController::new(1);
            let facilities = [Interception::RdtscExiting, Interception::MovDrExiting, Interception::Exception(Some(14))];
            let mut expected = [0u32; 3];

            for (facility, acquire) in ops {
                let index = usize::from(facility);
                if acquire {
                    controller.acquire(&platform, 0, facilities[index]).unwrap();
                    expected[index] += 1;
                } else {
                    controller.release(&platform, 0, facilities[index]);
                    expected[index] = expected[index].saturating_sub(1);
                }
                prop_assert_eq!(controller.count(0, facilities[index]), expected[index]);
            }

            for (index, facility) in facilities.iter().enumerate() {
                for _ in 0..expected[index] {
                    controller.release(&platform, 0, *facility);
                }
            }
            prop_assert!(controller.counts(0).is_empty());
        }
    }
}
