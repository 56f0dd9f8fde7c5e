//! Bounded FIFO queue used to pass frames and confirmations between the
//! interrupt-side producers and the service-side consumer.
//!
//! The queue carries no internal synchronization: the intended pattern is one
//! producer context (e.g. the CAN receive interrupt) and one consumer context
//! (a service handler) per queue. Callers needing multi-writer safety must
//! serialize externally, and the indices must not be touched while the queue
//! is in use.

use std::collections::VecDeque;

/// Fixed-capacity FIFO.
///
/// All operations are O(1). When `overwrite` is enabled a push onto a full
/// queue drops the oldest item instead of failing.
#[derive(Debug)]
pub struct Fifo<T> {
    items: VecDeque<T>,
    capacity: usize,
    overwrite: bool,
}

impl<T> Fifo<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(capacity: usize, overwrite: bool) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            overwrite,
        }
    }

    /// Appends an item at the tail.
    ///
    /// Returns `false` if the queue is full and overwrite is disabled; the
    /// item is dropped and no state changes.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() == self.capacity {
            if !self.overwrite {
                return false;
            }
            // Full with overwrite enabled: drop the oldest.
            self.items.pop_front();
        }
        self.items.push_back(item);
        true
    }

    /// Removes and returns the head item, or `None` if the queue is empty.
    ///
    /// Popping an empty queue is a no-op; the count never underflows.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Returns the `index`-th logical item (0 = head) without removing it.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Returns the head item without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Discards all queued items.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pop_empty_is_idempotent() {
        let mut fifo: Fifo<u32> = Fifo::new(4, false);
        assert_eq!(fifo.pop(), None);
        assert_eq!(fifo.pop(), None);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let mut fifo = Fifo::new(8, false);
        for i in 0..8u32 {
            assert!(fifo.push(i));
        }
        for i in 0..8u32 {
            assert_eq!(fifo.pop(), Some(i));
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_push_full_without_overwrite_drops_new_item() {
        let mut fifo = Fifo::new(2, false);
        assert!(fifo.push(1));
        assert!(fifo.push(2));
        assert!(!fifo.push(3));
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
    }

    #[test]
    fn test_overwrite_retains_newest_items() {
        let capacity = 4;
        let mut fifo = Fifo::new(capacity, true);
        for i in 0..capacity as u32 + 1 {
            assert!(fifo.push(i));
        }
        assert_eq!(fifo.len(), capacity);
        // Oldest item (0) was dropped.
        for i in 1..capacity as u32 + 1 {
            assert_eq!(fifo.pop(), Some(i));
        }
    }

    #[test]
    fn test_get_by_logical_index() {
        let mut fifo = Fifo::new(4, false);
        fifo.push(10);
        fifo.push(20);
        fifo.push(30);
        fifo.pop();
        assert_eq!(fifo.get(0), Some(&20));
        assert_eq!(fifo.get(1), Some(&30));
        assert_eq!(fifo.get(2), None);
    }

    #[test]
    fn test_clear() {
        let mut fifo = Fifo::new(4, false);
        fifo.push(1);
        fifo.push(2);
        fifo.clear();
        assert!(fifo.is_empty());
        assert_eq!(fifo.pop(), None);
    }
}
