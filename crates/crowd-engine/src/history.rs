use std::collections::VecDeque;

/// Fixed-capacity, append-only sequence that evicts its oldest entry when full.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<T> {
        self.entries.back().copied()
    }

    /// The last `n` entries, oldest first. `None` until `n` entries exist.
    pub fn tail(&self, n: usize) -> Option<Vec<T>> {
        if n == 0 || self.entries.len() < n {
            return None;
        }
        Some(self.entries.iter().skip(self.entries.len() - n).copied().collect())
    }

    /// Oldest-first snapshot
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
