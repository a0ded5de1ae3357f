//! Preallocated memory for work done in VMX root.
//!
//! VM-exit handlers cannot call the kernel allocator, so every page a hook, an EPT split or an
//! action buffer may need is reserved from a passive context and handed out from free lists.
//! Blocks released while other processors may still hold stale EPT translations are parked until
//! the invalidation barrier has been crossed.

use {
    crate::{
        error::HypervisorError,
        platform::{PageAllocation, Platform},
    },
    alloc::{collections::BTreeMap, vec, vec::Vec},
    spin::Mutex,
};

const PAGE_SIZE: usize = 0x1000;

/// What a block is reserved for. Blocks of different intentions never mix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolIntention {
    HookRecord,
    SplitTable,
    /// Shadow pages of hidden hooks and detour trampolines.
    ShadowPage,
    EventBuffer,
}

/// A block handed out by the pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolBlock {
    pub allocation: PageAllocation,
    pub pages: usize,
    pub intention: PoolIntention,
}

impl PoolBlock {
    pub fn va(&self) -> u64 {
        self.allocation.va
    }

    pub fn pa(&self) -> u64 {
        self.allocation.pa
    }

    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE).max(1)
}

type ClassKey = (PoolIntention, usize);

/// Free lists of preallocated blocks, one per (intention, size) class.
#[derive(Default)]
pub struct PoolManager {
    free: Mutex<BTreeMap<ClassKey, Vec<PageAllocation>>>,

    /// Reservations requested from VMX root, serviced by the next `replenish`.
    requests: Mutex<Vec<(ClassKey, usize)>>,

    /// Released blocks waiting for the invalidation generation they were retired at.
    retired: Mutex<Vec<(PoolBlock, u64)>>,

    /// Every allocation ever made, for teardown.
    owned: Mutex<Vec<(PageAllocation, usize)>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reservation of `count` blocks of `size` bytes. Safe to call from VMX root; the
    /// memory is allocated by the next [`Self::replenish`].
    pub fn request_allocation(&self, size: usize, count: usize, intention: PoolIntention) {
        self.requests.lock().push(((intention, pages_for(size)), count));
    }

    /// Services queued requests. Must run outside VMX root.
    pub fn replenish(&self, platform: &dyn Platform) -> Result<(), HypervisorError> {
        let requests = core::mem::take(&mut *self.requests.lock());
        for ((intention, pages), count) in requests {
            self.reserve(platform, pages * PAGE_SIZE, count, intention)?;
        }
        Ok(())
    }

    /// Allocates `count` blocks of `size` bytes right away. Must run outside VMX root.
    pub fn reserve(&self, platform: &dyn Platform, size: usize, count: usize, intention: PoolIntention) -> Result<(), HypervisorError> {
        let pages = pages_for(size);
        let mut reserved = Vec::with_capacity(count);

        for _ in 0..count {
            let Some(allocation) = platform.allocate_pages(pages) else {
                log::warn!("Reserved {} of {} {:?} blocks", reserved.len(), count, intention);
                self.push_free((intention, pages), reserved);
                return Err(HypervisorError::OutOfPool);
            };
            self.owned.lock().push((allocation, pages));
            reserved.push(allocation);
        }

        log::info!("Reserved {} {:?} blocks of {} pages", count, intention, pages);
        self.push_free((intention, pages), reserved);
        Ok(())
    }

    fn push_free(&self, key: ClassKey, blocks: Vec<PageAllocation>) {
        self.free.lock().entry(key).or_default().extend(blocks);
    }

    /// Takes a block of at least `size` bytes. Safe to call from VMX root.
    pub fn allocate(&self, intention: PoolIntention, size: usize) -> Result<PoolBlock, HypervisorError> {
        let pages = pages_for(size);
        let mut free = self.free.lock();

        let key = free
            .range((intention, pages)..=(intention, usize::MAX))
            .find(|(_, blocks)| !blocks.is_empty())
            .map(|(key, _)| *key)
            .ok_or(HypervisorError::OutOfPool)?;

        let allocation = free.get_mut(&key).and_then(Vec::pop).ok_or(HypervisorError::OutOfPool)?;
        Ok(PoolBlock { allocation, pages: key.1, intention })
    }

    /// Returns a block to its free list, zeroing it first.
    pub fn free(&self, platform: &dyn Platform, block: PoolBlock) {
        if !platform.write_physical(block.pa(), &vec![0u8; block.size()]) {
            log::warn!("Could not clear pool block at {:#x}", block.pa());
        }
        self.push_free((block.intention, block.pages), vec![block.allocation]);
    }

    /// Parks a block until invalidation generation `generation` has been observed everywhere.
    pub fn free_after(&self, block: PoolBlock, generation: u64) {
        self.retired.lock().push((block, generation));
    }

    /// Frees every parked block whose generation is at or below `completed`.
    pub fn reclaim(&self, platform: &dyn Platform, completed: u64) -> usize {
        let ready: Vec<PoolBlock> = {
            let mut retired = self.retired.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = retired.drain(..).partition(|(_, generation)| *generation <= completed);
            *retired = waiting;
            ready.into_iter().map(|(block, _)| block).collect()
        };

        let count = ready.len();
        for block in ready {
            self.free(platform, block);
        }
        count
    }

    pub fn available(&self, intention: PoolIntention, size: usize) -> usize {
        self.free
            .lock()
            .range((intention, pages_for(size))..=(intention, usize::MAX))
            .map(|(_, blocks)| blocks.len())
            .sum()
    }

    pub fn retired(&self) -> usize {
        self.retired.lock().len()
    }

    /// Returns every allocation to the platform. Only valid at unload, after VMXOFF.
    pub fn release_all(&self, platform: &dyn Platform) {
        self.free.lock().clear();
        self.retired.lock().clear();
        for (allocation, pages) in self.owned.lock().drain(..) {
            platform.free_pages(allocation, pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform};

    #[test]
    fn test_allocate_and_free() {
        let platform = MockPlatform::new(1);
        let pool = PoolManager::new();
        pool.reserve(&platform, PAGE_SIZE, 2, PoolIntention::ShadowPage).unwrap();

        let first = pool.allocate(PoolIntention::ShadowPage, 16).unwrap();
        let _second = pool.allocate(PoolIntention::ShadowPage, PAGE_SIZE).unwrap();
        assert_eq!(pool.allocate(PoolIntention::ShadowPage, 1), Err(HypervisorError::OutOfPool));
        assert_eq!(pool.allocate(PoolIntention::HookRecord, 1), Err(HypervisorError::OutOfPool));

        platform.write_memory(first.pa(), &[0xCC; 4]);
        pool.free(&platform, first);
        assert_eq!(pool.available(PoolIntention::ShadowPage, 1), 1);
        assert_eq!(platform.read_memory(first.pa(), 4), vec![0; 4]);
    }

    #[test]
    fn test_larger_class_satisfies_smaller_request() {
        let platform = MockPlatform::new(1);
        let pool = PoolManager::new();
        pool.reserve(&platform, 3 * PAGE_SIZE, 1, PoolIntention::EventBuffer).unwrap();

        let block = pool.allocate(PoolIntention::EventBuffer, 100).unwrap();
        assert_eq!(block.pages, 3);
        assert_eq!(pool.allocate(PoolIntention::EventBuffer, 4 * PAGE_SIZE), Err(HypervisorError::OutOfPool));
    }

    #[test]
    fn test_requests_are_serviced_by_replenish() {
        let platform = MockPlatform::new(1);
        let pool = PoolManager::new();

        pool.request_allocation(PAGE_SIZE, 3, PoolIntention::HookRecord);
        assert_eq!(pool.available(PoolIntention::HookRecord, 1), 0);

        pool.replenish(&platform).unwrap();
        assert_eq!(pool.available(PoolIntention::HookRecord, 1), 3);
    }

    #[test]
    fn test_out_of_memory_keeps_partial_reservation() {
        let platform = MockPlatform::new(1);
        platform.limit_allocations(1);
        let pool = PoolManager::new();

        assert_eq!(pool.reserve(&platform, PAGE_SIZE, 2, PoolIntention::SplitTable), Err(HypervisorError::OutOfPool));
        assert_eq!(pool.available(PoolIntention::SplitTable, 1), 1);
    }

    #[test]
    fn test_retired_blocks_wait_for_generation() {
        let platform = MockPlatform::new(1);
        let pool = PoolManager::new();
        pool.reserve(&platform, PAGE_SIZE, 1, PoolIntention::ShadowPage).unwrap();

        let block = pool.allocate(PoolIntention::ShadowPage, 1).unwrap();
        pool.free_after(block, 5);

        assert_eq!(pool.reclaim(&platform, 4), 0);
        assert_eq!(pool.available(PoolIntention::ShadowPage, 1), 0);
        assert_eq!(pool.reclaim(&platform, 5), 1);
        assert_eq!(pool.available(PoolIntention::ShadowPage, 1), 1);
    }
}
