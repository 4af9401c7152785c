//! Bounded FIFO of pending events.
//!
//! The queue keeps at most `capacity` items. Whenever an insertion would
//! exceed the bound, items are dropped from the front (oldest first) until it
//! holds again. The rule is the same for fresh pushes and for events restored
//! after a failed flush, so under sustained sink failure the oldest data is
//! what gets lost.
//!
//! Gating (sampling, identity) happens in the pipeline before anything
//! reaches this type.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// =============================================================================
// EventQueue
// =============================================================================

/// A bounded, ordered buffer.
///
/// # Example
///
/// ```ignore
/// let mut q = EventQueue::new(3);
/// for i in 1..=5 {
///     q.push(i);
/// }
/// assert_eq!(q.to_vec(), vec![3, 4, 5]);
/// ```
pub struct EventQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    total_pushed: u64,
    total_evicted: u64,
    total_restored: u64,
}

impl<T> EventQueue<T> {
    /// Create a new queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total_pushed: 0,
            total_evicted: 0,
            total_restored: 0,
        }
    }

    /// Append to the back, then trim the front to the bound.
    ///
    /// Returns the number of items evicted.
    pub fn push(&mut self, item: T) -> usize {
        self.items.push_back(item);
        self.total_pushed += 1;
        self.trim()
    }

    /// Remove and return every item, oldest first.
    pub fn drain_snapshot(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Put `items` back at the front, keeping their relative order, then trim
    /// the front to the bound.
    ///
    /// Returns the number of items evicted.
    pub fn restore(&mut self, items: Vec<T>) -> usize {
        self.total_restored += items.len() as u64;
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        self.trim()
    }

    fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.items.len() > self.capacity {
            self.items.pop_front();
            evicted += 1;
        }
        self.total_evicted += evicted as u64;
        evicted
    }

    /// Oldest pending item.
    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Newest pending item.
    #[must_use]
    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            len: self.items.len(),
            total_pushed: self.total_pushed,
            total_evicted: self.total_evicted,
            total_restored: self.total_restored,
            fill_ratio: self.items.len() as f64 / self.capacity as f64,
        }
    }
}

impl<T: Clone> EventQueue<T> {
    /// Owned copy of the contents, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.items.len())
            .field("total_pushed", &self.total_pushed)
            .field("total_evicted", &self.total_evicted)
            .finish()
    }
}

// =============================================================================
// QueueStats (serializable)
// =============================================================================

/// Serializable statistics about a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    /// Items ever pushed (restores not included).
    pub total_pushed: u64,
    /// Items dropped from the front to respect the bound.
    pub total_evicted: u64,
    /// Items put back after failed flushes.
    pub total_restored: u64,
    /// len / capacity
    pub fill_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
