//! Per-task device memory cache
//!
//! Each accelerator keeps, per registered task, a small ring of previously
//! allocated inference-slot offsets. Steady-state requests pop and push
//! offsets here instead of hitting the allocator.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::memory::DeviceMemory;
use crate::error::Result;

struct TaskCache {
    block_size: u64,
    offsets: VecDeque<u64>,
    /// Everything ever handed to this ring, for drain on unregister
    minted: Vec<u64>,
}

/// All task caches of one device
#[derive(Default)]
pub struct TaskCacheManager {
    caches: HashMap<u32, TaskCache>,
}

impl TaskCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate `count` slots of `block_size` bytes for a task. Fails
    /// when the allocator cannot satisfy all `count` slots; already
    /// allocated slots are rolled back so a caller can retry with a smaller
    /// count.
    pub fn register(
        &mut self,
        memory: &mut DeviceMemory,
        task_id: u32,
        block_size: u64,
        count: usize,
    ) -> Result<()> {
        let mut offsets = VecDeque::with_capacity(count);
        for _ in 0..count {
            match memory.allocate(block_size) {
                Ok(offset) => offsets.push_back(offset),
                Err(e) => {
                    for offset in offsets {
                        let _ = memory.deallocate(offset);
                    }
                    return Err(e);
                }
            }
        }
        debug!(task_id, count, block_size, "task memory cache registered");
        let minted = offsets.iter().copied().collect();
        self.caches.insert(
            task_id,
            TaskCache {
                block_size,
                offsets,
                minted,
            },
        );
        Ok(())
    }

    /// Register with count fallback: shrink the ring until the allocator
    /// accepts it. Returns the count actually registered (0 = failure).
    pub fn register_with_fallback(
        &mut self,
        memory: &mut DeviceMemory,
        task_id: u32,
        block_size: u64,
        mut count: usize,
    ) -> usize {
        while count > 0 {
            if self.register(memory, task_id, block_size, count).is_ok() {
                return count;
            }
            count -= 1;
        }
        0
    }

    pub fn is_registered(&self, task_id: u32) -> bool {
        self.caches.contains_key(&task_id)
    }

    /// True when a pop will succeed without touching the allocator
    pub fn can_get(&self, task_id: u32) -> bool {
        self.caches
            .get(&task_id)
            .map(|c| !c.offsets.is_empty())
            .unwrap_or(false)
    }

    /// Pop a cached offset, or fall back to a fresh allocation.
    pub fn get(&mut self, memory: &mut DeviceMemory, task_id: u32, size: u64) -> Result<u64> {
        if let Some(cache) = self.caches.get_mut(&task_id) {
            if let Some(offset) = cache.offsets.pop_front() {
                return Ok(offset);
            }
        }
        memory.allocate(size)
    }

    /// Return an offset. Offsets minted by the ring go back to it; anything
    /// else goes back to the allocator.
    pub fn put(&mut self, memory: &mut DeviceMemory, task_id: u32, offset: u64) -> Result<()> {
        if let Some(cache) = self.caches.get_mut(&task_id) {
            if cache.minted.contains(&offset) {
                cache.offsets.push_back(offset);
                return Ok(());
            }
        }
        memory.deallocate(offset)
    }

    /// Drain the ring and hand every slot back to the allocator.
    pub fn unregister(&mut self, memory: &mut DeviceMemory, task_id: u32) {
        if let Some(cache) = self.caches.remove(&task_id) {
            for offset in cache.minted {
                let _ = memory.deallocate(offset);
            }
            debug!(task_id, block_size = cache.block_size, "task memory cache unregistered");
        }
    }
}
