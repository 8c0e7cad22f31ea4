//! Pre-allocated object pools
//!
//! Requests and jobs are pool-owned and addressed by index; everything else
//! holds indices or weak handles. Picking scans circularly from the last
//! hand-out position and claims a slot with a single atomic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Maximum simultaneously live requests per engine
pub const REQUEST_MAX_COUNT: usize = 4096;

/// Maximum simultaneously live inference jobs per engine
pub const INFERENCE_JOB_MAX_COUNT: usize = 256;

/// Implemented by pooled objects; occupancy must be a single atomic claim.
pub trait PoolItem {
    /// Claim the slot; false when it is already in use
    fn try_occupy(&self) -> bool;
    /// Give the slot back
    fn vacate(&self);
}

/// Circular pool of pre-allocated objects
pub struct CircularPool<T> {
    slots: Vec<Arc<T>>,
    next: AtomicUsize,
}

impl<T: PoolItem> CircularPool<T> {
    /// Build a pool from `count` items produced by `make(index)`.
    pub fn new(count: usize, make: impl Fn(usize) -> T) -> Self {
        Self {
            slots: (0..count).map(|i| Arc::new(make(i))).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free object, scanning at most one full cycle.
    pub fn pick(&self) -> Result<Arc<T>> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.slots.len() {
            let idx = (start + i) % self.slots.len();
            if self.slots[idx].try_occupy() {
                return Ok(Arc::clone(&self.slots[idx]));
            }
        }
        Err(Error::InvalidOperation("object pool exhausted".into()))
    }

    /// Resolve a pool index
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.slots.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Slot {
        id: usize,
        used: AtomicBool,
    }

    impl PoolItem for Slot {
        fn try_occupy(&self) -> bool {
            !self.used.swap(true, Ordering::AcqRel)
        }
        fn vacate(&self) {
            self.used.store(false, Ordering::Release);
        }
    }

    #[test]
    fn test_pick_and_vacate() {
        let pool = CircularPool::new(2, |id| Slot {
            id,
            used: AtomicBool::new(false),
        });
        let a = pool.pick().unwrap();
        let b = pool.pick().unwrap();
        assert_ne!(a.id, b.id);
        assert!(pool.pick().is_err());
        a.vacate();
        assert!(pool.pick().is_ok());
    }

    #[test]
    fn test_get_by_index() {
        let pool = CircularPool::new(3, |id| Slot {
            id,
            used: AtomicBool::new(false),
        });
        assert_eq!(pool.get(2).unwrap().id, 2);
        assert!(pool.get(3).is_none());
    }
}
