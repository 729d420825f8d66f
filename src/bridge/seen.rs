//! Already-forwarded spot ids
//!
//! Insertion-ordered and bounded: once `max_entries` is exceeded the oldest
//! ids are dropped first.

use std::collections::{HashSet, VecDeque};

pub struct SeenSet {
    /// Ids in insertion order (oldest first)
    order: VecDeque<String>,
    members: HashSet<String>,
    max_entries: usize,
}

impl SeenSet {
    pub fn new(max_entries: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Record an id. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.members.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());

        // Trim if exceeding limit
        while self.order.len() > self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
