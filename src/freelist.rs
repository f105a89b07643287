//! Carrier allocator: the ordered set of public sectors free to host
//! hidden ciphertext.
//!
//! Insertion is idempotent and keeps the set ordered; allocation removes
//! the lowest-numbered run of the requested length. One lock guards the
//! whole structure (the engine wraps it in a mutex), so walks here never
//! race with insertions.

use std::collections::BTreeSet;

use crate::config::CARRIERS_PER_HIDDEN;
use crate::error::{Result, VeilError};

/// Ordered free set of public sector numbers.
#[derive(Debug, Default)]
pub struct FreeList {
    sectors: BTreeSet<u32>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free sectors currently tracked.
    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Add a sector. Duplicate insertions are no-ops.
    pub fn add(&mut self, sector: u32) {
        self.sectors.insert(sector);
    }

    /// Whether a sector is currently free.
    pub fn contains(&self, sector: u32) -> bool {
        self.sectors.contains(&sector)
    }

    /// Remove a specific sector (used when a carrier run is re-pinned by
    /// the map rather than allocated).
    pub fn remove(&mut self, sector: u32) -> bool {
        self.sectors.remove(&sector)
    }

    /// Allocate the lowest-numbered run of `count` consecutive free
    /// sectors, unlinking it from the set.
    pub fn allocate_run(&mut self, count: usize) -> Result<u32> {
        if count == 0 {
            return Err(VeilError::ConfigInvalid(
                "zero-length carrier allocation".into(),
            ));
        }
        let mut run_start: Option<u32> = None;
        let mut run_len = 0usize;
        let mut prev: Option<u32> = None;
        for &sector in &self.sectors {
            match prev {
                Some(p) if sector == p + 1 => run_len += 1,
                _ => {
                    run_start = Some(sector);
                    run_len = 1;
                }
            }
            prev = Some(sector);
            if run_len == count {
                let start = match run_start {
                    Some(s) => s,
                    None => break,
                };
                for s in start..start + count as u32 {
                    self.sectors.remove(&s);
                }
                return Ok(start);
            }
        }
        Err(VeilError::NoCarriers {
            needed: count,
            available: self.sectors.len(),
        })
    }

    /// Allocate one full hidden-sector carrier run.
    pub fn allocate_carrier_run(&mut self) -> Result<u32> {
        self.allocate_run(CARRIERS_PER_HIDDEN)
    }

    /// Return a previously allocated run (tree node teardown path).
    pub fn release_run(&mut self, start: u32, count: usize) {
        for s in start..start + count as u32 {
            self.sectors.insert(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_ordered() {
        let mut fl = FreeList::new();
        fl.add(30);
        fl.add(10);
        fl.add(10);
        fl.add(20);
        assert_eq!(fl.len(), 3);
    }

    #[test]
    fn allocates_lowest_run() {
        let mut fl = FreeList::new();
        // two candidate runs: 100..104 and 50..54
        for s in 100..105 {
            fl.add(s);
        }
        for s in 50..55 {
            fl.add(s);
        }
        let start = fl.allocate_run(5).unwrap();
        assert_eq!(start, 50);
        assert_eq!(fl.len(), 5);
        assert!(!fl.contains(52));
        assert!(fl.contains(102));
    }

    #[test]
    fn skips_too_short_runs() {
        let mut fl = FreeList::new();
        fl.add(1);
        fl.add(2);
        // gap
        for s in 10..14 {
            fl.add(s);
        }
        assert_eq!(fl.allocate_run(4).unwrap(), 10);
    }

    #[test]
    fn fails_when_no_run_fits() {
        let mut fl = FreeList::new();
        fl.add(1);
        fl.add(3);
        fl.add(5);
        match fl.allocate_run(2) {
            Err(VeilError::NoCarriers { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 3);
            }
            other => panic!("expected NoCarriers, got {other:?}"),
        }
    }

    #[test]
    fn release_makes_run_allocatable_again() {
        let mut fl = FreeList::new();
        for s in 0..8 {
            fl.add(s);
        }
        let start = fl.allocate_run(8).unwrap();
        assert!(fl.is_empty());
        fl.release_run(start, 8);
        assert_eq!(fl.allocate_run(8).unwrap(), start);
    }
}
