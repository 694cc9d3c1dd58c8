//! Message Ring Buffer
//!
//! Bounded buffer of the most recent log messages produced during a
//! promise iteration, kept for reporting.

use std::collections::VecDeque;

/// Default number of messages retained per promise iteration.
pub const DEFAULT_CAPACITY: usize = 5;

#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    items: VecDeque<String>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, items: VecDeque::with_capacity(capacity) }
    }

    /// Append a message, evicting the oldest when full.
    pub fn push(&mut self, message: impl Into<String>) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(message.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest-first iteration.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|s| s.as_str())
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_iterate() {
        let mut buf = RingBuffer::new(3);
        buf.push("one");
        buf.push("two");
        assert_eq!(buf.iter().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let mut buf = RingBuffer::new(3);
        for i in 1..=5 {
            buf.push(format!("m{}", i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.iter().collect::<Vec<_>>(), vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn test_empty() {
        let buf = RingBuffer::default();
        assert!(buf.is_empty());
        assert_eq!(buf.iter().count(), 0);
    }
}
