//! Output of `print`, `printf` and the engine's own notices.
//!
//! Messages queue in a bounded ring. The IOCTL path drains it into the user-mode buffer; a
//! connected debugger receives it as `LoggingMechanism` packets. When the ring is full the oldest
//! message is dropped.

use {
    alloc::{collections::VecDeque, string::String, vec::Vec},
    core::sync::atomic::{AtomicBool, AtomicU64, Ordering},
    spin::Mutex,
};

/// Messages kept before the oldest is dropped.
pub const MESSAGE_RING_CAPACITY: usize = 512;

/// Longest message stored; longer text is cut.
pub const MAX_MESSAGE_LENGTH: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Tag of the event whose action printed, 0 for engine notices.
    pub tag: u64,
    /// The producer asked for delivery without waiting for a flush.
    pub immediate: bool,
    pub text: String,
}

pub struct MessageSink {
    ring: Mutex<VecDeque<Message>>,
    capacity: usize,
    dropped: AtomicU64,
    /// An immediate message is waiting for the transport.
    urgent: AtomicBool,
}

impl Default for MessageSink {
    fn default() -> Self {
        Self::new(MESSAGE_RING_CAPACITY)
    }
}

impl MessageSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            urgent: AtomicBool::new(false),
        }
    }

    pub fn push(&self, tag: u64, immediate: bool, text: &str) {
        let mut text = String::from(text);
        if text.len() > MAX_MESSAGE_LENGTH {
            let mut end = MAX_MESSAGE_LENGTH;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }

        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(Message { tag, immediate, text });

        if immediate {
            self.urgent.store(true, Ordering::Release);
        }
    }

    /// Removes up to `max` messages, oldest first.
    pub fn drain(&self, max: usize) -> Vec<Message> {
        let mut ring = self.ring.lock();
        let count = max.min(ring.len());
        let drained = ring.drain(..count).collect();
        if ring.is_empty() {
            self.urgent.store(false, Ordering::Release);
        }
        drained
    }

    /// Discards every queued message and returns how many there were.
    pub fn flush(&self) -> usize {
        let mut ring = self.ring.lock();
        let count = ring.len();
        ring.clear();
        self.urgent.store(false, Ordering::Release);
        count
    }

    /// Whether an immediate message waits for delivery.
    pub fn has_urgent(&self) -> bool {
        self.urgent.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let sink = MessageSink::new(2);
        sink.push(1, false, "a");
        sink.push(2, false, "b");
        sink.push(3, true, "c");

        assert_eq!(sink.dropped(), 1);
        assert!(sink.has_urgent());

        let messages = sink.drain(10);
        assert_eq!(messages.iter().map(|m| m.tag).collect::<Vec<_>>(), [2, 3]);
        assert!(!sink.has_urgent());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_long_messages_are_cut() {
        let sink = MessageSink::default();
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 10);
        sink.push(0, false, &long);
        assert_eq!(sink.drain(1)[0].text.len(), MAX_MESSAGE_LENGTH);
        assert_eq!(sink.flush(), 0);
    }
}
