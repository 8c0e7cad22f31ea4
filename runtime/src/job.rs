//! Inference job
//!
//! Orchestrates one end-to-end inference over the task graph. Completed
//! tasks publish their output tensors into a job-local registry keyed by
//! tensor name; every task whose input set becomes fully satisfied is armed
//! and dispatched. When every task is done the declared output order is
//! resolved into the result vector.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::engine::EngineCore;
use crate::error::{Error, Result};
use crate::model::Processor;
use crate::pools::PoolItem;
use crate::request::Request;
use crate::task::Task;
use crate::tensor::{DataPtr, Tensor, TensorList};

/// Opaque user payload carried through a job into the completion callback
pub type UserArg = Arc<dyn Any + Send + Sync>;

/// Per-task progress within one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRunState {
    Idle,
    Ready,
    Busy,
    Done,
}

/// Job lifecycle, observed by `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Busy,
    Done,
    Failed,
}

#[derive(Default)]
struct JobState {
    tasks: Vec<Arc<Task>>,
    head: Option<Arc<Task>>,
    input_tasks: Vec<Arc<Task>>,
    task_status: HashMap<String, TaskRunState>,
    tensors: HashMap<String, Tensor>,
    output_order: Vec<String>,
    request_ids: Vec<usize>,
    user_output: DataPtr,
    user_arg: Option<UserArg>,
    results: TensorList,
    store_result: bool,
    latency_us: u64,
    inference_time_us: u64,
    error: Option<Error>,
    /// Owned copies of caller inputs for asynchronous submissions
    input_hold: Vec<Vec<u8>>,
    /// Restrict this job's requests to one device (validation path)
    device_pin: Option<usize>,
}

pub struct InferenceJob {
    id: usize,
    in_use: AtomicBool,
    /// Bumped on every clear; stale completions compare against it
    generation: AtomicU64,
    core: Mutex<Weak<EngineCore>>,
    state: Mutex<JobState>,
    status: Mutex<JobStatus>,
    wait_cv: Condvar,
    done_count: AtomicUsize,
    total_count: AtomicUsize,
}

impl InferenceJob {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            in_use: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            core: Mutex::new(Weak::new()),
            state: Mutex::new(JobState::default()),
            status: Mutex::new(JobStatus::Idle),
            wait_cv: Condvar::new(),
            done_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock() = status;
        self.wait_cv.notify_all();
    }

    /// Sum of per-request latencies in microseconds
    pub fn latency_us(&self) -> u64 {
        self.state.lock().latency_us
    }

    /// Sum of NPU inference times in microseconds
    pub fn inference_time_us(&self) -> u64 {
        self.state.lock().inference_time_us
    }

    /// Arm the job for one inference over `tasks`.
    pub fn setup(
        &self,
        core: &Arc<EngineCore>,
        tasks: Vec<Arc<Task>>,
        head: Option<Arc<Task>>,
        input_tasks: Vec<Arc<Task>>,
        output_order: Vec<String>,
        store_result: bool,
    ) {
        *self.core.lock() = Arc::downgrade(core);
        let mut state = self.state.lock();
        state.task_status = tasks
            .iter()
            .map(|t| (t.name().to_string(), TaskRunState::Idle))
            .collect();
        self.total_count.store(tasks.len(), Ordering::Release);
        self.done_count.store(0, Ordering::Release);
        state.tasks = tasks;
        state.head = head;
        state.input_tasks = input_tasks;
        state.output_order = output_order;
        state.store_result = store_result;
        state.tensors.clear();
        state.request_ids.clear();
        state.results.clear();
        state.latency_us = 0;
        state.inference_time_us = 0;
        state.error = None;
        state.user_output = DataPtr::null();
        state.user_arg = None;
        state.input_hold.clear();
        state.device_pin = None;
    }

    /// Take ownership of caller input bytes for the lifetime of this run
    /// (asynchronous submissions must not borrow the caller's buffer).
    pub fn hold_input(&self, bytes: Vec<u8>) -> DataPtr {
        let mut state = self.state.lock();
        state.input_hold.push(bytes);
        let held = state.input_hold.last().expect("just pushed");
        DataPtr(held.as_ptr() as *mut u8)
    }

    /// Restrict this job's requests to one device
    pub fn set_device_pin(&self, device_id: usize) {
        self.state.lock().device_pin = Some(device_id);
    }

    pub fn device_pin(&self) -> Option<usize> {
        self.state.lock().device_pin
    }

    fn core(&self) -> Result<Arc<EngineCore>> {
        self.core
            .lock()
            .upgrade()
            .ok_or_else(|| Error::InvalidOperation("engine disposed".into()))
    }

    /// Map a tail task's declared outputs straight into the caller's output
    /// buffer using model-global offsets.
    fn user_mapped_outputs(
        core: &Arc<EngineCore>,
        task: &Arc<Task>,
        user_output: DataPtr,
    ) -> Vec<Tensor> {
        task.outputs(DataPtr::null())
            .into_iter()
            .filter_map(|mut t| {
                let offset = core.output_offset(t.name())?;
                t.set_data(user_output.add(offset as usize));
                t.set_user_buffer_mapped(true);
                Some(t)
            })
            .collect()
    }

    /// Start a single-input job: create the head request and dispatch it.
    pub fn start(
        &self,
        input: DataPtr,
        user_arg: Option<UserArg>,
        output: DataPtr,
    ) -> Result<usize> {
        let started = self.start_inner(input, user_arg, output);
        if started.is_err() {
            self.set_status(JobStatus::Failed);
        }
        started
    }

    fn start_inner(
        &self,
        input: DataPtr,
        user_arg: Option<UserArg>,
        output: DataPtr,
    ) -> Result<usize> {
        let core = self.core()?;
        let head = self
            .state
            .lock()
            .head
            .clone()
            .ok_or_else(|| Error::InvalidOperation("job has no head task".into()))?;

        self.set_status(JobStatus::Busy);
        let req = core.request_pool().pick()?;
        let inputs = head.inputs(input);
        req.init(Arc::clone(&head), inputs, Vec::new(), self.id, self.generation());

        {
            let mut state = self.state.lock();
            state.user_arg = user_arg;
            state.user_output = output;
            state.request_ids.push(req.id());
            state
                .task_status
                .insert(head.name().to_string(), TaskRunState::Busy);
            if !output.is_null() && head.is_tail() {
                let mapped = Self::user_mapped_outputs(&core, &head, output);
                if !mapped.is_empty() {
                    req.set_outputs(mapped);
                    req.set_output_buffer_base(output, true);
                }
            }
        }
        core.submit(&req).map_err(|e| {
            self.fail_with(&req, &e.to_string());
            e
        })?;
        Ok(self.id)
    }

    /// Start a multi-head job: seed the tensor registry with the provided
    /// inputs and dispatch every task whose input set is satisfied.
    pub fn start_multi_input(
        &self,
        inputs: &HashMap<String, DataPtr>,
        user_arg: Option<UserArg>,
        output: DataPtr,
    ) -> Result<usize> {
        let started = self.start_multi_input_inner(inputs, user_arg, output);
        if started.is_err() {
            self.set_status(JobStatus::Failed);
        }
        started
    }

    fn start_multi_input_inner(
        &self,
        inputs: &HashMap<String, DataPtr>,
        user_arg: Option<UserArg>,
        output: DataPtr,
    ) -> Result<usize> {
        let core = self.core()?;
        self.set_status(JobStatus::Busy);
        {
            let mut state = self.state.lock();
            state.user_arg = user_arg;
            state.user_output = output;
            let tasks = state.tasks.clone();
            for (name, &ptr) in inputs {
                // bind the consuming task's declared descriptor to the
                // caller's bytes
                let descriptor = tasks.iter().find_map(|task| {
                    task.info()
                        .inputs
                        .iter()
                        .find(|t| &t.name == name)
                        .map(|t| t.to_tensor())
                });
                match descriptor {
                    Some(mut t) => {
                        t.set_data(ptr);
                        state.tensors.insert(name.clone(), t);
                    }
                    None => {
                        warn!(job = self.id, tensor = %name, "input tensor consumed by no task");
                        let mut t = Tensor::new(name.clone(), vec![], crate::tensor::DataType::Uint8);
                        t.set_data(ptr);
                        state.tensors.insert(name.clone(), t);
                    }
                }
            }
        }

        let tasks = self.state.lock().tasks.clone();
        for task in tasks {
            if self.check_and_set_ready(&task) {
                self.process_ready_task(&task)?;
            }
        }
        Ok(self.id)
    }

    /// A task flips to READY iff it is IDLE and every declared input name is
    /// present in the job's tensor registry.
    fn check_and_set_ready(&self, task: &Arc<Task>) -> bool {
        let mut state = self.state.lock();
        match state.task_status.get(task.name()) {
            Some(TaskRunState::Idle) => {}
            _ => return false,
        }
        let satisfied = task
            .info()
            .inputs
            .iter()
            .all(|t| state.tensors.contains_key(&t.name));
        if satisfied {
            state
                .task_status
                .insert(task.name().to_string(), TaskRunState::Ready);
        }
        satisfied
    }

    /// Create and dispatch the request of a READY task, binding its inputs
    /// from the tensor registry in declared order.
    fn process_ready_task(&self, task: &Arc<Task>) -> Result<()> {
        let core = self.core()?;
        let req = {
            let mut state = self.state.lock();
            match state.task_status.get(task.name()) {
                Some(TaskRunState::Ready) => {}
                _ => return Ok(()),
            }
            let mut inputs = Vec::with_capacity(task.info().inputs.len());
            for info in &task.info().inputs {
                let Some(tensor) = state.tensors.get(&info.name) else {
                    return Err(Error::InvalidOperation(format!(
                        "input tensor '{}' vanished from job registry",
                        info.name
                    )));
                };
                inputs.push(tensor.clone());
            }
            let req = core.request_pool().pick()?;
            req.init(Arc::clone(task), inputs, Vec::new(), self.id, self.generation());
            if !state.user_output.is_null()
                && task.is_tail()
                && task.processor() == Processor::Cpu
            {
                let mapped = Self::user_mapped_outputs(&core, task, state.user_output);
                if !mapped.is_empty() {
                    req.set_outputs(mapped);
                    req.set_output_buffer_base(state.user_output, true);
                }
            }
            state.request_ids.push(req.id());
            state
                .task_status
                .insert(task.name().to_string(), TaskRunState::Busy);
            req
        };
        core.submit(&req).map_err(|e| {
            self.fail_with(&req, &e.to_string());
            e
        })
    }

    /// Called by the scheduling layer when a request finishes successfully.
    pub fn on_request_complete(&self, req: &Arc<Request>) {
        if req.job_generation() != self.generation() || self.status() != JobStatus::Busy {
            debug!(request = req.id(), "stale completion; recycling request");
            req.reset();
            return;
        }
        let task = req.task();
        let all_done = {
            let mut state = self.state.lock();
            for output in req.outputs() {
                let name = output.name().to_string();
                if state.tensors.insert(name.clone(), output).is_some() {
                    warn!(job = self.id, tensor = %name, "overwriting tensor in job registry");
                }
            }
            state.latency_us += req.latency_us();
            if task.processor() == Processor::Npu {
                state.inference_time_us += req.inference_time_us() as u64;
            }
            state
                .task_status
                .insert(task.name().to_string(), TaskRunState::Done);
            let done = self.done_count.fetch_add(1, Ordering::AcqRel) + 1;
            done == self.total_count.load(Ordering::Acquire)
        };
        task.push_latency(req.latency_us());
        if task.processor() == Processor::Npu {
            task.push_inference_time(req.inference_time_us() as u64);
        }
        task.set_last_output(req.outputs());
        task.increment_inference_count();

        if !task.is_tail() {
            for next in task.nexts() {
                if self.check_and_set_ready(&next) {
                    if let Err(e) = self.process_ready_task(&next) {
                        warn!(job = self.id, task = %next.name(), error = %e, "downstream dispatch failed");
                        return;
                    }
                }
            }
        } else if all_done {
            self.finish();
        }
    }

    /// Called by the scheduling layer when a request fails.
    pub fn on_request_failed(&self, req: &Arc<Request>, message: &str) {
        if req.job_generation() != self.generation() || self.status() != JobStatus::Busy {
            req.reset();
            return;
        }
        self.fail_with(req, message);
    }

    fn fail_with(&self, req: &Arc<Request>, message: &str) {
        {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(Error::DeviceIo(format!(
                    "task '{}' failed: {message}",
                    req.task().name()
                )));
            }
            state.request_ids.retain(|&id| id != req.id());
        }
        req.reset();
        self.set_status(JobStatus::Failed);
    }

    /// Resolve the declared output order into the result vector, hand the
    /// pooled buffers back, and wake the waiter.
    fn finish(&self) {
        let core = match self.core() {
            Ok(core) => core,
            Err(_) => {
                self.set_status(JobStatus::Failed);
                return;
            }
        };
        let (results, request_ids, user_arg, store_result, latency, inf_time) = {
            let mut state = self.state.lock();
            debug_assert_eq!(
                self.done_count.load(Ordering::Acquire),
                self.total_count.load(Ordering::Acquire),
                "finish with incomplete task set"
            );
            let mut results = TensorList::with_capacity(state.output_order.len());
            let mut missing = Vec::new();
            for name in &state.output_order {
                let Some(tensor) = state.tensors.get(name) else {
                    missing.push(name.clone());
                    continue;
                };
                if state.user_output.is_null() {
                    // hand back an owned copy
                    let bytes = unsafe { tensor.to_vec() };
                    results.push(tensor.with_owned(bytes));
                } else {
                    // ensure the bytes live in the caller's buffer at the
                    // model-global offset
                    let offset = core.output_offset(name).unwrap_or(0) as usize;
                    let dst = state.user_output.add(offset);
                    if tensor.data() != dst {
                        let size = tensor.size_in_bytes();
                        unsafe {
                            std::ptr::copy_nonoverlapping(tensor.data().0, dst.0, size);
                        }
                    }
                    let mut mapped = tensor.with_data(dst);
                    mapped.set_user_buffer_mapped(true);
                    results.push(mapped);
                }
            }
            if !missing.is_empty() {
                state.error = Some(Error::InvalidOperation(format!(
                    "declared outputs missing from job registry: {missing:?}"
                )));
            }
            state.results = results.clone();
            (
                results,
                std::mem::take(&mut state.request_ids),
                state.user_arg.clone(),
                state.store_result,
                state.latency_us,
                state.inference_time_us,
            )
        };

        // recycle requests (and their buffer-sets) before waking the caller
        for id in request_ids {
            if let Some(req) = core.request_pool().get(id) {
                req.reset();
            }
        }

        core.record_job_stats(latency, inf_time);
        core.run_completion_callback(&results, user_arg.as_ref());

        let failed = self.state.lock().error.is_some();
        self.set_status(if failed { JobStatus::Failed } else { JobStatus::Done });
        if !store_result {
            self.clear();
            self.vacate();
        }
    }

    /// Block until the job leaves BUSY, then take the result vector. The
    /// job slot is recycled on return.
    pub fn wait(&self) -> Result<TensorList> {
        let mut status = self.status.lock();
        while *status == JobStatus::Busy {
            self.wait_cv.wait(&mut status);
        }
        let failed = *status == JobStatus::Failed;
        drop(status);

        let (results, error) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.results), state.error.take())
        };
        self.clear();
        self.vacate();
        match (failed, error) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(Error::InvalidOperation("inference job failed".into())),
            _ => Ok(results),
        }
    }

    /// Drop all per-run state and bump the generation.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.state.lock() = JobState::default();
        *self.core.lock() = Weak::new();
        self.done_count.store(0, Ordering::Release);
        self.total_count.store(0, Ordering::Release);
        *self.status.lock() = JobStatus::Idle;
    }
}

impl PoolItem for InferenceJob {
    fn try_occupy(&self) -> bool {
        !self.in_use.swap(true, Ordering::AcqRel)
    }

    fn vacate(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}
