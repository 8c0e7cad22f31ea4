//! Device memory allocator
//!
//! Bump allocation within the accelerator's memory window. Forward
//! allocations serve per-request inference slots; backward allocations hold
//! long-lived per-task regions (register map, weights, post-processing
//! binary) and grow down from the top of the window. There is no
//! compaction: per-request slots are recycled through the per-task cache,
//! and backward regions live until task unregister.

use std::collections::BTreeMap;

use crate::config::{align_up, MEM_ALIGN};
use crate::error::{Error, Result};

pub struct DeviceMemory {
    base: u64,
    size: u64,
    /// Next forward offset
    fwd: u64,
    /// Lowest backward offset handed out
    bwd: u64,
    /// Live allocations, offset -> size
    live: BTreeMap<u64, u64>,
}

impl DeviceMemory {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            fwd: 0,
            bwd: size,
            live: BTreeMap::new(),
        }
    }

    /// Physical base of the window
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes not covered by either frontier
    pub fn free_bytes(&self) -> u64 {
        self.bwd.saturating_sub(self.fwd)
    }

    /// Forward allocation; returns the offset within the window.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let size = align_up(size.max(1), MEM_ALIGN);
        if self.fwd + size > self.bwd {
            return Err(Error::InvalidOperation(format!(
                "device memory exhausted: need {size} B, {} B free",
                self.free_bytes()
            )));
        }
        let offset = self.fwd;
        self.fwd += size;
        self.live.insert(offset, size);
        Ok(offset)
    }

    /// Backward allocation for long-lived regions, growing down from the top.
    pub fn allocate_backward(&mut self, size: u64) -> Result<u64> {
        let size = align_up(size.max(1), MEM_ALIGN);
        if self.bwd < self.fwd + size {
            return Err(Error::InvalidOperation(format!(
                "device memory exhausted: need {size} B backward, {} B free",
                self.free_bytes()
            )));
        }
        self.bwd -= size;
        let offset = self.bwd;
        self.live.insert(offset, size);
        Ok(offset)
    }

    /// Free by offset. A block at a frontier rolls the frontier back over
    /// any trailing free space; an interior free leaves a hole that is only
    /// reclaimed once the frontier retreats past it.
    pub fn deallocate(&mut self, offset: u64) -> Result<()> {
        let size = self.live.remove(&offset).ok_or_else(|| {
            Error::InvalidArgument(format!("deallocate of unknown offset {offset:#x}"))
        })?;
        if offset + size == self.fwd {
            self.fwd = self
                .live
                .range(..self.fwd)
                .next_back()
                .map(|(&o, &s)| o + s)
                .unwrap_or(0);
        } else if offset == self.bwd {
            self.bwd = self
                .live
                .range(offset..)
                .next()
                .map(|(&o, _)| o)
                .unwrap_or(self.size);
        }
        Ok(())
    }
}
