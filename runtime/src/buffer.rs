//! Fixed-size buffer pool
//!
//! A bounded pool of page-aligned byte regions allocated once at
//! construction. `acquire` is O(1) and blocks when the pool is drained,
//! which is what bounds the number of in-flight requests per task.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::config::PAGE_ALIGN;
use crate::error::{Error, Result};
use crate::tensor::DataPtr;

/// Acquire waits at most this long before reporting a deadlock.
const ACQUIRE_SAFETY_TIMEOUT: Duration = Duration::from_secs(3600);

struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct FreeList {
    free: Vec<usize>,
    is_free: Vec<bool>,
}

/// Bounded pool of `count` aligned blocks of `slot_size` bytes each
pub struct FixedSizeBufferPool {
    regions: Vec<Region>,
    by_addr: HashMap<usize, usize>,
    slot_size: usize,
    state: Mutex<FreeList>,
    cv: Condvar,
}

impl FixedSizeBufferPool {
    /// Allocate `count` zeroed blocks of `slot_size` bytes, page-aligned.
    pub fn new(slot_size: usize, count: usize) -> Result<Self> {
        let size = slot_size.max(1);
        let layout = Layout::from_size_align(size, PAGE_ALIGN)
            .map_err(|e| Error::InvalidArgument(format!("bad pool layout: {e}")))?;
        let mut regions = Vec::with_capacity(count);
        let mut by_addr = HashMap::with_capacity(count);
        for i in 0..count {
            let raw = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(raw).ok_or_else(|| {
                Error::ResourceExhausted(format!("failed to allocate pool slot of {size} bytes"))
            })?;
            by_addr.insert(ptr.as_ptr() as usize, i);
            regions.push(Region { ptr, layout });
        }
        Ok(Self {
            regions,
            by_addr,
            slot_size: size,
            state: Mutex::new(FreeList {
                free: (0..count).rev().collect(),
                is_free: vec![true; count],
            }),
            cv: Condvar::new(),
        })
    }

    /// Size of one slot in bytes
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.regions.len()
    }

    /// Snapshot of currently free slots
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Pop a free block, waiting if the pool is drained.
    ///
    /// The wait carries a safety timeout that only fires on a true deadlock;
    /// firing is surfaced as [`Error::ResourceExhausted`].
    pub fn acquire(&self) -> Result<DataPtr> {
        let mut state = self.state.lock();
        while state.free.is_empty() {
            let timed_out = self
                .cv
                .wait_for(&mut state, ACQUIRE_SAFETY_TIMEOUT)
                .timed_out();
            if timed_out && state.free.is_empty() {
                error!(
                    capacity = self.regions.len(),
                    "buffer acquire timed out; possible deadlock"
                );
                return Err(Error::ResourceExhausted(
                    "buffer acquire timed out; possible deadlock".into(),
                ));
            }
        }
        let index = state.free.pop().expect("free list non-empty");
        state.is_free[index] = false;
        debug!(index, remaining = state.free.len(), "buffer acquired");
        Ok(DataPtr(self.regions[index].ptr.as_ptr()))
    }

    /// Return a block to the pool and wake one waiter.
    ///
    /// Releasing a pointer this pool did not mint is an error. Releasing a
    /// block twice is reported and ignored; the free list is never
    /// corrupted.
    pub fn release(&self, ptr: DataPtr) -> Result<()> {
        if ptr.is_null() {
            debug!("release of null buffer ignored");
            return Ok(());
        }
        let index = *self.by_addr.get(&(ptr.0 as usize)).ok_or_else(|| {
            Error::InvalidArgument("released pointer was not minted by this pool".into())
        })?;
        let mut state = self.state.lock();
        if state.is_free[index] {
            error!(index, "double release detected; ignoring");
            return Ok(());
        }
        state.is_free[index] = true;
        state.free.push(index);
        drop(state);
        self.cv.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release_accounting() {
        let pool = FixedSizeBufferPool::new(1024, 4).unwrap();
        assert_eq!(pool.available(), 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 2);
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_slots_are_page_aligned_and_zeroed() {
        let pool = FixedSizeBufferPool::new(100, 2).unwrap();
        let p = pool.acquire().unwrap();
        assert_eq!(p.0 as usize % PAGE_ALIGN, 0);
        let contents = unsafe { std::slice::from_raw_parts(p.0, 100) };
        assert!(contents.iter().all(|&b| b == 0));
        pool.release(p).unwrap();
    }

    #[test]
    fn test_double_release_is_harmless() {
        let pool = FixedSizeBufferPool::new(64, 1).unwrap();
        let p = pool.acquire().unwrap();
        pool.release(p).unwrap();
        pool.release(p).unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let pool = FixedSizeBufferPool::new(64, 1).unwrap();
        let mut foreign = [0u8; 64];
        let err = pool.release(DataPtr(foreign.as_mut_ptr())).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_pool_blocks_until_release() {
        let pool = Arc::new(FixedSizeBufferPool::new(64, 1).unwrap());
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(held).unwrap();
        let reacquired = waiter.join().unwrap();
        assert_eq!(reacquired, held);
    }
}
