//! Device pool
//!
//! Owns every device discovered at engine open and picks one per request
//! under a least-loaded policy. Saturated candidate sets block on a shared
//! condition that every device completion signals.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::Device;
use crate::error::{Error, Result};

/// Upper bound on claimed capacity per device before pickers wait
const DEVICE_MAX_LOAD: usize = 64;

/// Shared wake-up for device capacity
#[derive(Default)]
pub struct DeviceSignal {
    gate: Mutex<()>,
    cv: Condvar,
}

impl DeviceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let _gate = self.gate.lock();
        self.cv.notify_all();
    }
}

pub struct DevicePool {
    devices: RwLock<Vec<Arc<Device>>>,
    signal: Arc<DeviceSignal>,
}

impl DevicePool {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            signal: Arc::new(DeviceSignal::new()),
        }
    }

    pub fn signal(&self) -> Arc<DeviceSignal> {
        Arc::clone(&self.signal)
    }

    pub fn add(&self, device: Arc<Device>) {
        self.devices.write().push(device);
    }

    pub fn count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn get(&self, id: usize) -> Option<Arc<Device>> {
        self.devices.read().iter().find(|d| d.id() == id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    fn try_pick(&self, candidates: &[usize], max_load: usize) -> Option<Arc<Device>> {
        let devices = self.devices.read();
        devices
            .iter()
            .filter(|d| !d.is_blocked() && !d.is_stopped())
            .filter(|d| candidates.is_empty() || candidates.contains(&d.id()))
            .filter(|d| d.load() < max_load)
            .min_by_key(|d| d.load())
            .cloned()
    }

    /// Least-loaded usable device among the candidate set. Blocked devices
    /// are skipped; an empty candidate set means "any".
    pub fn pick_one(&self, candidates: &[usize]) -> Result<Arc<Device>> {
        self.try_pick(candidates, usize::MAX).ok_or_else(|| {
            Error::DeviceIo("no usable device for the requested candidate set".into())
        })
    }

    /// Like [`DevicePool::pick_one`] but waits until a candidate has
    /// capacity. The claimed unit is already accounted on return.
    pub fn wait_one(&self, candidates: &[usize]) -> Result<Arc<Device>> {
        loop {
            if let Some(device) = self.try_pick(candidates, DEVICE_MAX_LOAD) {
                device.pick();
                return Ok(device);
            }
            // nothing usable at all (every candidate blocked or stopped)?
            if self.try_pick(candidates, usize::MAX).is_none() {
                return Err(Error::DeviceIo(
                    "no usable device for the requested candidate set".into(),
                ));
            }
            let mut gate = self.signal.gate.lock();
            self.signal
                .cv
                .wait_for(&mut gate, Duration::from_millis(100));
        }
    }

    /// Terminate every device in reverse discovery order.
    pub fn terminate_all(&self) {
        for device in self.devices.read().iter().rev() {
            device.terminate();
        }
    }
}

impl Default for DevicePool {
    fn default() -> Self {
        Self::new()
    }
}
