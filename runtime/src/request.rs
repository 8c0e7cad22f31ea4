//! Request
//!
//! One execution of one task for one job. Requests are owned by the
//! request pool and addressed by their stable pool index; the job and the
//! device in-flight table hold indices, never owning references.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::driver::{AccRequest, DeviceResponse};
use crate::error::{Error, Result};
use crate::pools::{CircularPool, PoolItem, REQUEST_MAX_COUNT};
use crate::task::{BufferSet, Task};
use crate::tensor::{DataPtr, Tensor};

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Idle = 0,
    Busy = 1,
    Done = 2,
}

#[derive(Default)]
struct RequestState {
    job_id: Option<usize>,
    job_generation: u64,
    task: Option<Arc<Task>>,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    /// Address per-tensor output offsets are measured from: a task-local
    /// buffer, or the caller's output buffer with model-global offsets
    output_buffer_base: DataPtr,
    outputs_is_user_buffer: bool,
    encoded_inputs: DataPtr,
    encoded_outputs: DataPtr,
    buffer_set: Option<BufferSet>,
    buffer_released: bool,
    acc: AccRequest,
    started_at: Option<Instant>,
    latency_us: u64,
    inference_time_us: u32,
    processed_by: String,
    failed: bool,
}

pub struct Request {
    id: usize,
    in_use: AtomicBool,
    status: AtomicU8,
    state: Mutex<RequestState>,
}

impl Request {
    fn new(id: usize) -> Self {
        Self {
            id,
            in_use: AtomicBool::new(false),
            status: AtomicU8::new(RequestStatus::Idle as u8),
            state: Mutex::new(RequestState::default()),
        }
    }

    /// Stable pool-unique id
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        match self.status.load(Ordering::Acquire) {
            0 => RequestStatus::Idle,
            1 => RequestStatus::Busy,
            _ => RequestStatus::Done,
        }
    }

    pub fn set_status(&self, status: RequestStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Bind this request to a task and job; captures the start time point.
    pub fn init(
        &self,
        task: Arc<Task>,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
        job_id: usize,
        job_generation: u64,
    ) {
        let mut state = self.state.lock();
        state.job_id = Some(job_id);
        state.job_generation = job_generation;
        state.task = Some(task);
        state.inputs = inputs;
        state.outputs = outputs;
        state.started_at = Some(Instant::now());
        self.set_status(RequestStatus::Busy);
    }

    pub fn job_id(&self) -> Option<usize> {
        self.state.lock().job_id
    }

    pub fn job_generation(&self) -> u64 {
        self.state.lock().job_generation
    }

    pub fn task(&self) -> Arc<Task> {
        self.state
            .lock()
            .task
            .clone()
            .expect("request bound to a task")
    }

    pub fn inputs(&self) -> Vec<Tensor> {
        self.state.lock().inputs.clone()
    }

    pub fn outputs(&self) -> Vec<Tensor> {
        self.state.lock().outputs.clone()
    }

    pub fn set_outputs(&self, outputs: Vec<Tensor>) {
        self.state.lock().outputs = outputs;
    }

    pub fn set_output_shape(&self, index: usize, shape: Vec<i64>) {
        let mut state = self.state.lock();
        if let Some(t) = state.outputs.get_mut(index) {
            t.set_shape(shape);
        }
    }

    pub fn output_buffer_base(&self) -> DataPtr {
        self.state.lock().output_buffer_base
    }

    pub fn set_output_buffer_base(&self, base: DataPtr, is_user_buffer: bool) {
        let mut state = self.state.lock();
        state.output_buffer_base = base;
        state.outputs_is_user_buffer = is_user_buffer;
    }

    pub fn outputs_is_user_buffer(&self) -> bool {
        self.state.lock().outputs_is_user_buffer
    }

    pub fn encoded_inputs(&self) -> DataPtr {
        self.state.lock().encoded_inputs
    }

    pub fn encoded_outputs(&self) -> DataPtr {
        self.state.lock().encoded_outputs
    }

    pub fn set_encoded_buffers(&self, inputs: DataPtr, outputs: DataPtr) {
        let mut state = self.state.lock();
        state.encoded_inputs = inputs;
        state.encoded_outputs = outputs;
    }

    pub fn set_buffer_set(&self, set: BufferSet) {
        let mut state = self.state.lock();
        state.buffer_set = Some(set);
        state.buffer_released = false;
    }

    pub fn has_buffer_set(&self) -> bool {
        self.state.lock().buffer_set.is_some()
    }

    /// Release the owned buffer-set back to the task pools, exactly once.
    pub fn release_buffers(&self) {
        let (task, set) = {
            let mut state = self.state.lock();
            if state.buffer_released {
                return;
            }
            let Some(set) = state.buffer_set.take() else {
                return;
            };
            state.buffer_released = true;
            (state.task.clone(), set)
        };
        if let Some(task) = task {
            task.release_all_buffers(&set);
        }
    }

    pub fn acc(&self) -> AccRequest {
        self.state.lock().acc
    }

    pub fn set_acc(&self, acc: AccRequest) {
        self.state.lock().acc = acc;
    }

    pub fn set_processed_by(&self, tag: &str) {
        self.state.lock().processed_by = tag.to_string();
    }

    pub fn processed_by(&self) -> String {
        self.state.lock().processed_by.clone()
    }

    pub fn mark_failed(&self) {
        self.state.lock().failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Record the end time point; returns the measured latency.
    pub fn finish_timing(&self, response: Option<&DeviceResponse>) -> u64 {
        let mut state = self.state.lock();
        let latency = state
            .started_at
            .map(|s| s.elapsed().as_micros() as u64)
            .unwrap_or(0);
        state.latency_us = latency;
        state.inference_time_us = response.map(|r| r.inf_time).unwrap_or(0);
        latency
    }

    pub fn latency_us(&self) -> u64 {
        self.state.lock().latency_us
    }

    pub fn inference_time_us(&self) -> u32 {
        self.state.lock().inference_time_us
    }

    /// Clear all state and return the slot to the pool. Any still-owned
    /// buffer-set goes back to its task pools first.
    pub fn reset(&self) {
        self.release_buffers();
        {
            let mut state = self.state.lock();
            *state = RequestState::default();
        }
        self.set_status(RequestStatus::Idle);
        self.vacate();
    }
}

impl PoolItem for Request {
    fn try_occupy(&self) -> bool {
        !self.in_use.swap(true, Ordering::AcqRel)
    }

    fn vacate(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Pool of pre-allocated requests
pub struct RequestPool {
    pool: CircularPool<Request>,
}

impl RequestPool {
    pub fn new(count: usize) -> Self {
        Self {
            pool: CircularPool::new(count, Request::new),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(REQUEST_MAX_COUNT)
    }

    pub fn pick(&self) -> Result<Arc<Request>> {
        self.pool
            .pick()
            .map_err(|_| Error::InvalidOperation("request pool exhausted".into()))
    }

    pub fn get(&self, id: usize) -> Option<Arc<Request>> {
        self.pool.get(id)
    }
}
