//! Registered events, bucketed by type.
//!
//! Each bucket is a list in registration order behind its own lock. Triggering takes a snapshot
//! of the bucket and releases the lock before any condition or action runs, so actions may
//! register, modify or terminate events (including their own) without deadlocking.

use {
    super::{Event, EventType, TAG_SEED},
    alloc::{sync::Arc, vec::Vec},
    core::sync::atomic::{AtomicU64, Ordering},
    spin::RwLock,
};

pub struct EventRegistry {
    buckets: Vec<RwLock<Vec<Arc<Event>>>>,
    next_tag: AtomicU64,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            buckets: (0..EventType::COUNT).map(|_| RwLock::new(Vec::new())).collect(),
            next_tag: AtomicU64::new(TAG_SEED),
        }
    }

    /// Hands out the next tag. Tags are never reused within a run.
    pub fn allocate_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, event: Arc<Event>) {
        self.buckets[event.event_type.index()].write().push(event);
    }

    pub fn remove(&self, tag: u64) -> Option<Arc<Event>> {
        self.buckets.iter().find_map(|bucket| {
            let mut events = bucket.write();
            let position = events.iter().position(|event| event.tag == tag)?;
            Some(events.remove(position))
        })
    }

    pub fn find(&self, tag: u64) -> Option<Arc<Event>> {
        self.buckets
            .iter()
            .find_map(|bucket| bucket.read().iter().find(|event| event.tag == tag).cloned())
    }

    /// Events of one type in registration order.
    pub fn snapshot(&self, event_type: EventType) -> Vec<Arc<Event>> {
        self.buckets[event_type.index()].read().clone()
    }

    /// Whether any event of `event_type` is registered, enabled or not.
    pub fn has_events(&self, event_type: EventType) -> bool {
        !self.buckets[event_type.index()].read().is_empty()
    }

    /// Every event, ordered by tag.
    pub fn all(&self) -> Vec<Arc<Event>> {
        let mut events: Vec<_> = self.buckets.iter().flat_map(|bucket| bucket.read().clone()).collect();
        events.sort_by_key(|event| event.tag);
        events
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
