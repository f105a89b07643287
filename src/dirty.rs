//! Per-request set of public sectors whose IV counter has already been
//! bumped in the current read-modify-write pass.
//!
//! The set prevents double-incrementing a counter when one request touches
//! the same carrier twice. It is owned by the request and drained on every
//! exit path, including error exits.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct DirtySet {
    sectors: HashSet<u64>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sector`'s counter was bumped. Idempotent.
    pub fn add(&mut self, sector: u64) -> bool {
        self.sectors.insert(sector)
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.sectors.contains(&sector)
    }

    /// Forget a sector (its slot was randomized, so the bump no longer
    /// applies).
    pub fn remove(&mut self, sector: u64) -> bool {
        self.sectors.remove(&sector)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Drain on request exit.
    pub fn clear(&mut self) {
        self.sectors.clear();
    }
}
