//! Inference engine
//!
//! The public entry point: loads a compiled model package, builds the task
//! graph, owns the device and worker pools, and exposes the synchronous and
//! asynchronous run surface.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{EngineOptions, RuntimeConfig};
use crate::cpu::{default_executor_factory, CpuExecutorFactory, CpuTaskHandle, CpuWorker};
use crate::device::pool::DevicePool;
use crate::device::{Device, ResponseSink};
use crate::driver::DriverAdapter;
use crate::error::{Error, Result};
use crate::events::EventDispatcher;
use crate::job::{InferenceJob, UserArg};
use crate::model::{ModelPackage, Processor};
use crate::pools::{CircularPool, INFERENCE_JOB_MAX_COUNT};
use crate::profiler::{LatencyStats, Profiler};
use crate::request::RequestPool;
use crate::task::Task;
use crate::tensor::{DataPtr, TensorList};

/// Identifier returned by the asynchronous run calls
pub type JobId = usize;

/// Completion callback: `(outputs, user_arg) -> status`
pub type EngineCallback = Arc<dyn Fn(&TensorList, Option<&UserArg>) -> i32 + Send + Sync>;

/// Sub-batches of this many jobs run concurrently in `run_batch`
const SUB_BATCH_MAX_COUNT: usize = 128;

/// Shared state threaded through jobs, devices and workers
pub(crate) struct EngineCore {
    config: RuntimeConfig,
    profiler: Arc<Profiler>,
    events: Arc<EventDispatcher>,
    request_pool: RequestPool,
    job_pool: CircularPool<InferenceJob>,
    device_pool: DevicePool,
    tasks: Vec<Arc<Task>>,
    head: Option<Arc<Task>>,
    input_tasks: Vec<Arc<Task>>,
    output_order: Vec<String>,
    output_offsets: HashMap<String, u64>,
    /// Per-output user-layout sizes, aligned with `output_order`
    output_sizes: Vec<u64>,
    output_total: u64,
    input_order: Vec<String>,
    input_sizes: Vec<u64>,
    input_total: u64,
    callback: RwLock<Option<EngineCallback>>,
    latency_stats: LatencyStats,
    inference_stats: LatencyStats,
    disposed: AtomicBool,
}

impl EngineCore {
    pub(crate) fn request_pool(&self) -> &RequestPool {
        &self.request_pool
    }

    pub(crate) fn job_pool(&self) -> &CircularPool<InferenceJob> {
        &self.job_pool
    }

    pub(crate) fn device_pool(&self) -> &DevicePool {
        &self.device_pool
    }

    pub(crate) fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// Model-global byte offset of a declared output tensor
    pub(crate) fn output_offset(&self, name: &str) -> Option<u64> {
        self.output_offsets.get(name).copied()
    }

    pub(crate) fn record_job_stats(&self, latency_us: u64, inference_time_us: u64) {
        self.latency_stats.record(latency_us);
        if inference_time_us > 0 {
            self.inference_stats.record(inference_time_us);
        }
    }

    pub(crate) fn run_completion_callback(&self, outputs: &TensorList, user_arg: Option<&UserArg>) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            let status = callback(outputs, user_arg);
            if status != 0 {
                warn!(status, "completion callback reported failure");
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("engine already disposed".into()));
        }
        Ok(())
    }
}

/// The public inference engine
pub struct InferenceEngine {
    core: Arc<EngineCore>,
    cpu_handles: Vec<Arc<CpuTaskHandle>>,
    model_name: String,
    compiler_version: u32,
    file_format_version: u32,
    compile_type: String,
    task_order: Vec<String>,
    multi_input: bool,
    has_dynamic_output: bool,
}

impl InferenceEngine {
    /// Open a model, discovering accelerators from the standard device
    /// nodes.
    pub fn open(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let adapters = discover_adapters();
        Self::open_with_adapters(path, options, adapters)
    }

    /// Open a model against an explicit set of driver adapters. Used by
    /// embedders and by the loopback test harness.
    pub fn open_with_adapters(
        path: impl AsRef<Path>,
        options: EngineOptions,
        adapters: Vec<Arc<dyn DriverAdapter>>,
    ) -> Result<Self> {
        let config = options
            .runtime
            .clone()
            .unwrap_or_else(RuntimeConfig::from_env);
        let package = ModelPackage::load(path)?;
        Self::from_package(package, options, config, adapters)
    }

    fn from_package(
        package: ModelPackage,
        options: EngineOptions,
        config: RuntimeConfig,
        adapters: Vec<Arc<dyn DriverAdapter>>,
    ) -> Result<Self> {
        let events = Arc::new(EventDispatcher::new());
        let profiler = Arc::new(Profiler::new(options.profiler || config.show_profile > 0));

        let device_pool = DevicePool::new();
        for (id, adapter) in adapters.into_iter().enumerate() {
            let device = Device::new(
                id,
                adapter,
                config.clone(),
                Arc::clone(&events),
                device_pool.signal(),
            )?;
            device_pool.add(device);
        }

        let needs_npu = package
            .subgraphs
            .iter()
            .any(|sg| sg.processor == Processor::Npu);
        if needs_npu && device_pool.count() == 0 {
            return Err(Error::DeviceIo(
                "model contains NPU subgraphs but no accelerator was found".into(),
            ));
        }

        let all_device_ids: Vec<usize> = device_pool.all().iter().map(|d| d.id()).collect();
        let device_ids = if options.device_ids.is_empty() {
            all_device_ids
        } else {
            options.device_ids.clone()
        };
        let device_num = device_ids.len().max(1);
        let buffer_count = options.buffer_count.max(1);

        let factory: Option<CpuExecutorFactory> = options
            .cpu_executor_factory
            .clone()
            .or_else(default_executor_factory);

        // Build one task per subgraph in topological order.
        let mut tasks: Vec<Arc<Task>> = Vec::with_capacity(package.topo_order.len());
        let mut cpu_handles = Vec::new();
        for (idx, name) in package.topo_order.iter().enumerate() {
            let sg = package
                .subgraph(name)
                .ok_or_else(|| Error::InvalidModel(format!("unknown subgraph '{name}'")))?
                .clone();
            let cpu_handle = match (&sg.processor, &sg.cpu) {
                (Processor::Cpu, Some(cpu)) => {
                    let factory = factory.as_ref().ok_or_else(|| {
                        Error::InvalidOperation(format!(
                            "CPU subgraph '{name}' present but no CPU executor is available"
                        ))
                    })?;
                    let executor = factory(&cpu.model)?;
                    let handle =
                        Arc::new(CpuTaskHandle::new(name.clone(), executor, cpu.model.len()));
                    cpu_handles.push(Arc::clone(&handle));
                    Some(handle)
                }
                _ => None,
            };
            tasks.push(Task::new(
                idx as u32,
                sg,
                device_ids.clone(),
                buffer_count,
                cpu_handle,
            )?);
        }

        // Producer index and graph edges by tensor-name matching.
        let mut producers: HashMap<String, usize> = HashMap::new();
        for (idx, task) in tasks.iter().enumerate() {
            for out in &task.info().outputs {
                producers.insert(out.name.clone(), idx);
            }
        }
        for (idx, task) in tasks.iter().enumerate() {
            let mut upstream: Vec<usize> = task
                .info()
                .inputs
                .iter()
                .filter_map(|t| producers.get(&t.name).copied())
                .filter(|&p| p != idx)
                .collect();
            upstream.sort_unstable();
            upstream.dedup();
            for p in upstream {
                tasks[p].add_next(Arc::clone(task));
                task.add_prev(Arc::clone(&tasks[p]));
            }
            let external = task.info().inputs.iter().any(|t| {
                package.inputs.contains(&t.name) || !producers.contains_key(&t.name)
            });
            if external {
                task.set_head();
            }
            if task
                .info()
                .outputs
                .iter()
                .any(|t| package.outputs.contains(&t.name))
            {
                task.set_tail();
            }
        }

        // the declared topological order must place every producer before
        // its consumers; anything else means a cycle or a bad container
        for (idx, task) in tasks.iter().enumerate() {
            for input in &task.info().inputs {
                if let Some(&p) = producers.get(&input.name) {
                    if p >= idx {
                        return Err(Error::InvalidModel(format!(
                            "tensor '{}' is consumed by '{}' before its producer '{}'",
                            input.name,
                            task.name(),
                            tasks[p].name()
                        )));
                    }
                }
            }
        }

        // a terminal task whose outputs are not declared model outputs would
        // leave the job's done-count short forever
        for task in &tasks {
            if task.nexts().is_empty() && !task.is_tail() {
                return Err(Error::InvalidModel(format!(
                    "task '{}' has no consumers and produces no declared model output",
                    task.name()
                )));
            }
        }

        let input_tasks: Vec<Arc<Task>> = tasks.iter().filter(|t| t.is_head()).cloned().collect();
        if input_tasks.is_empty() {
            return Err(Error::InvalidModel("model has no head task".into()));
        }
        let head = input_tasks.first().cloned();

        // Canonical output order and model-global output offsets.
        let mut output_offsets = HashMap::new();
        let mut output_sizes = Vec::with_capacity(package.outputs.len());
        let mut output_total = 0u64;
        for name in &package.outputs {
            let producer = producers.get(name).copied().ok_or_else(|| {
                Error::InvalidModel(format!("declared output '{name}' has no producer"))
            })?;
            let size = tasks[producer]
                .info()
                .outputs
                .iter()
                .find(|t| &t.name == name)
                .map(|t| t.user_size())
                .unwrap_or(0);
            output_offsets.insert(name.clone(), output_total);
            output_sizes.push(size);
            output_total += size;
        }
        for task in tasks.iter().filter(|t| t.is_tail()) {
            let first = task
                .info()
                .outputs
                .iter()
                .filter_map(|t| output_offsets.get(&t.name).copied())
                .min()
                .unwrap_or(0);
            task.set_tail_offset(first as i64);
        }

        // Model input order and sizes (from the consuming task descriptors).
        let mut input_sizes = Vec::with_capacity(package.inputs.len());
        for name in &package.inputs {
            let size = tasks
                .iter()
                .find_map(|task| {
                    task.info()
                        .inputs
                        .iter()
                        .find(|t| &t.name == name)
                        .map(|t| t.user_size())
                })
                .ok_or_else(|| {
                    Error::InvalidModel(format!("model input '{name}' is consumed by no task"))
                })?;
            input_sizes.push(size);
        }
        let input_total: u64 = input_sizes.iter().sum();

        let has_dynamic_output = tasks.iter().any(|task| {
            task.info()
                .outputs
                .iter()
                .any(|t| t.shape.iter().any(|&d| d < 0))
        });

        let core = Arc::new(EngineCore {
            config: config.clone(),
            profiler,
            events,
            request_pool: RequestPool::with_default_capacity(),
            job_pool: CircularPool::new(INFERENCE_JOB_MAX_COUNT, InferenceJob::new),
            device_pool,
            tasks: tasks.clone(),
            head,
            input_tasks,
            output_order: package.outputs.clone(),
            output_offsets,
            output_sizes,
            output_total,
            input_order: package.inputs.clone(),
            input_sizes,
            input_total,
            callback: RwLock::new(None),
            latency_stats: LatencyStats::new(),
            inference_stats: LatencyStats::new(),
            disposed: AtomicBool::new(false),
        });

        // Register NPU tasks and start the device pipelines.
        for device in core.device_pool.all() {
            for task in tasks.iter().filter(|t| t.processor() == Processor::Npu) {
                if task.device_ids().contains(&device.id()) {
                    device.register_task(task)?;
                }
            }
            let sink: Arc<dyn ResponseSink> = core.clone() as Arc<dyn ResponseSink>;
            device.start(sink);
        }

        // Start the CPU workers.
        for handle in &cpu_handles {
            let weak = Arc::downgrade(&core);
            let completion: crate::cpu::worker::CompletionFn =
                Arc::new(move |req, result| match weak.upgrade() {
                    Some(core) => match result {
                        Ok(()) => core.complete_request(&req, None),
                        Err(e) => core.fail_request(&req, &e.to_string()),
                    },
                    None => req.reset(),
                });
            let worker = CpuWorker::start(
                handle.name().to_string(),
                handle.executor(),
                completion,
                options.cpu_threads,
                handle.initial_dynamic_threads(),
                config.dynamic_cpu_thread,
                buffer_count,
                device_num,
            );
            handle.attach_worker(worker);
        }

        info!(
            model = %package.model_name,
            tasks = tasks.len(),
            devices = core.device_pool.count(),
            "inference engine ready"
        );
        Ok(Self {
            core,
            cpu_handles,
            model_name: package.model_name,
            compiler_version: package.compiler_version,
            file_format_version: package.file_format_version,
            compile_type: package.compile_type,
            task_order: package.topo_order,
            multi_input: package.inputs.len() > 1,
            has_dynamic_output,
        })
    }

    fn new_job(&self, store_result: bool) -> Result<Arc<InferenceJob>> {
        self.core.ensure_live()?;
        let job = self
            .core
            .job_pool
            .pick()
            .map_err(|_| Error::InvalidOperation("inference job pool exhausted".into()))?;
        job.setup(
            &self.core,
            self.core.tasks.clone(),
            self.core.head.clone(),
            self.core.input_tasks.clone(),
            self.core.output_order.clone(),
            store_result,
        );
        Ok(job)
    }

    fn check_input_len(&self, len: usize) -> Result<()> {
        if len as u64 != self.core.input_total {
            return Err(Error::InvalidArgument(format!(
                "input buffer is {len} bytes, model expects {}",
                self.core.input_total
            )));
        }
        Ok(())
    }

    fn split_monolithic(&self, input: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
        self.check_input_len(input.len())?;
        let mut out = HashMap::new();
        let mut offset = 0usize;
        for (name, &size) in self.core.input_order.iter().zip(&self.core.input_sizes) {
            out.insert(name.clone(), input[offset..offset + size as usize].to_vec());
            offset += size as usize;
        }
        Ok(out)
    }

    /// Synchronous single-input inference. For multi-input models a
    /// monolithic buffer of exactly the summed input size is auto-split in
    /// declared order.
    pub fn run(&self, input: &[u8]) -> Result<TensorList> {
        if self.multi_input {
            let split = self.split_monolithic(input)?;
            let borrowed: HashMap<&str, &[u8]> = split
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice()))
                .collect();
            return self.run_multi_input(&borrowed);
        }
        self.check_input_len(input.len())?;
        let job = self.new_job(true)?;
        if let Err(e) = job.start(DataPtr(input.as_ptr() as *mut u8), None, DataPtr::null()) {
            let _ = job.wait();
            return Err(e);
        }
        job.wait()
    }

    /// Synchronous inference writing the declared outputs into `output` at
    /// model-global offsets. The returned tensors point into `output`.
    pub fn run_into(
        &self,
        input: &[u8],
        output: &mut [u8],
        user_arg: Option<UserArg>,
    ) -> Result<TensorList> {
        self.check_input_len(input.len())?;
        if (output.len() as u64) < self.core.output_total {
            return Err(Error::InvalidArgument(format!(
                "output buffer is {} bytes, model needs {}",
                output.len(),
                self.core.output_total
            )));
        }
        let job = self.new_job(true)?;
        if let Err(e) = job.start(
            DataPtr(input.as_ptr() as *mut u8),
            user_arg,
            DataPtr(output.as_mut_ptr()),
        ) {
            let _ = job.wait();
            return Err(e);
        }
        job.wait()
    }

    /// Asynchronous single-input inference. The input is copied; completion
    /// is observed through `wait` or the registered callback.
    pub fn run_async(&self, input: &[u8], user_arg: Option<UserArg>) -> Result<JobId> {
        if self.multi_input {
            let split = self.split_monolithic(input)?;
            return self.run_async_multi_input_owned(split, user_arg);
        }
        self.check_input_len(input.len())?;
        let store_result = self.core.callback.read().is_none();
        let job = self.new_job(store_result)?;
        let held = job.hold_input(input.to_vec());
        job.start(held, user_arg, DataPtr::null()).map_err(|e| {
            let _ = job.wait();
            e
        })
    }

    /// Synchronous multi-input inference with tensors keyed by name.
    pub fn run_multi_input(&self, inputs: &HashMap<&str, &[u8]>) -> Result<TensorList> {
        let bound = self.validate_multi_inputs(inputs)?;
        let job = self.new_job(true)?;
        if let Err(e) = job.start_multi_input(&bound, None, DataPtr::null()) {
            let _ = job.wait();
            return Err(e);
        }
        job.wait()
    }

    /// Synchronous multi-input inference with buffers in declared input
    /// order.
    pub fn run_multi_input_vec(&self, inputs: &[&[u8]]) -> Result<TensorList> {
        let map = self.vec_to_map(inputs)?;
        self.run_multi_input(&map)
    }

    /// Asynchronous multi-input inference; inputs are copied.
    pub fn run_async_multi_input(
        &self,
        inputs: &HashMap<&str, &[u8]>,
        user_arg: Option<UserArg>,
    ) -> Result<JobId> {
        let owned: HashMap<String, Vec<u8>> = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        self.run_async_multi_input_owned(owned, user_arg)
    }

    fn run_async_multi_input_owned(
        &self,
        inputs: HashMap<String, Vec<u8>>,
        user_arg: Option<UserArg>,
    ) -> Result<JobId> {
        {
            let borrowed: HashMap<&str, &[u8]> = inputs
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice()))
                .collect();
            self.validate_multi_input_names(&borrowed)?;
        }
        let store_result = self.core.callback.read().is_none();
        let job = self.new_job(store_result)?;
        let mut bound = HashMap::new();
        for (name, bytes) in inputs {
            let ptr = job.hold_input(bytes);
            bound.insert(name, ptr);
        }
        job.start_multi_input(&bound, user_arg, DataPtr::null())
            .map_err(|e| {
                let _ = job.wait();
                e
            })
    }

    fn vec_to_map<'a>(&self, inputs: &[&'a [u8]]) -> Result<HashMap<&str, &'a [u8]>> {
        if inputs.len() != self.core.input_order.len() {
            return Err(Error::InvalidArgument(format!(
                "expected {} input buffers, got {}",
                self.core.input_order.len(),
                inputs.len()
            )));
        }
        Ok(self
            .core
            .input_order
            .iter()
            .map(|s| s.as_str())
            .zip(inputs.iter().copied())
            .collect())
    }

    fn validate_multi_input_names(&self, inputs: &HashMap<&str, &[u8]>) -> Result<()> {
        if !self.multi_input && self.core.input_order.len() != 1 {
            return Err(Error::InvalidArgument(
                "this model is not a multi-input model".into(),
            ));
        }
        if inputs.len() != self.core.input_order.len() {
            return Err(Error::InvalidArgument(format!(
                "expected {} input tensors, got {}",
                self.core.input_order.len(),
                inputs.len()
            )));
        }
        for name in inputs.keys() {
            if !self.core.input_order.iter().any(|n| n == name) {
                return Err(Error::InvalidArgument(format!(
                    "unknown input tensor name '{name}'"
                )));
            }
        }
        Ok(())
    }

    fn validate_multi_inputs(
        &self,
        inputs: &HashMap<&str, &[u8]>,
    ) -> Result<HashMap<String, DataPtr>> {
        self.validate_multi_input_names(inputs)?;
        for (name, &size) in self.core.input_order.iter().zip(&self.core.input_sizes) {
            let buf = inputs.get(name.as_str()).expect("validated above");
            if buf.len() as u64 != size {
                return Err(Error::InvalidArgument(format!(
                    "input '{name}' is {} bytes, expected {size}",
                    buf.len()
                )));
            }
        }
        Ok(inputs
            .iter()
            .map(|(k, v)| (k.to_string(), DataPtr(v.as_ptr() as *mut u8)))
            .collect())
    }

    /// Block until an asynchronous job completes and take its outputs.
    /// Valid only for jobs started without a registered callback.
    pub fn wait(&self, job_id: JobId) -> Result<TensorList> {
        self.core.ensure_live()?;
        let job = self
            .core
            .job_pool
            .get(job_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown job id {job_id}")))?;
        job.wait()
    }

    /// Batched synchronous inference. Sub-batches of up to 128 jobs run
    /// concurrently; the result order matches the input order.
    pub fn run_batch(
        &self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        user_args: &[Option<UserArg>],
    ) -> Result<Vec<TensorList>> {
        if inputs.is_empty() {
            return Err(Error::InvalidArgument("batch is empty".into()));
        }
        if inputs.len() != outputs.len() {
            return Err(Error::InvalidArgument(
                "input and output batch lengths differ".into(),
            ));
        }
        if !user_args.is_empty() && user_args.len() != inputs.len() {
            return Err(Error::InvalidArgument(
                "user-arg batch length differs from input batch".into(),
            ));
        }
        // validate everything up front so no job starts against a bad buffer
        for (i, input) in inputs.iter().enumerate() {
            self.check_input_len(input.len())?;
            if (outputs[i].len() as u64) < self.core.output_total {
                return Err(Error::InvalidArgument(format!(
                    "output buffer {i} is too small"
                )));
            }
        }
        let mut results: Vec<TensorList> = Vec::with_capacity(inputs.len());
        for chunk_start in (0..inputs.len()).step_by(SUB_BATCH_MAX_COUNT) {
            let chunk_end = (chunk_start + SUB_BATCH_MAX_COUNT).min(inputs.len());
            let mut job_ids = Vec::with_capacity(chunk_end - chunk_start);
            let mut start_error = None;
            for i in chunk_start..chunk_end {
                let job = match self.new_job(true) {
                    Ok(job) => job,
                    Err(e) => {
                        start_error = Some(e);
                        break;
                    }
                };
                let user_arg = user_args.get(i).cloned().flatten();
                match job.start(
                    DataPtr(inputs[i].as_ptr() as *mut u8),
                    user_arg,
                    DataPtr(outputs[i].as_mut_ptr()),
                ) {
                    Ok(_) => job_ids.push(job.id()),
                    Err(e) => {
                        let _ = job.wait();
                        start_error = Some(e);
                        break;
                    }
                }
            }
            // drain everything already in flight before surfacing an error;
            // the caller's buffers must not be written after we return
            let mut wait_error = None;
            for job_id in job_ids {
                match self.wait(job_id) {
                    Ok(outputs) => results.push(outputs),
                    Err(e) => wait_error = Some(e),
                }
            }
            if let Some(e) = start_error.or(wait_error) {
                return Err(e);
            }
        }
        Ok(results)
    }

    /// One synchronous inference pinned to a single device; used by device
    /// validation tooling.
    pub fn validate_device(&self, input: &[u8], device_id: usize) -> Result<TensorList> {
        self.core.ensure_live()?;
        if self.core.device_pool.get(device_id).is_none() {
            return Err(Error::InvalidArgument(format!(
                "unknown device id {device_id}"
            )));
        }
        self.check_input_len(input.len())?;
        let job = self.new_job(true)?;
        job.set_device_pin(device_id);
        if let Err(e) = job.start(DataPtr(input.as_ptr() as *mut u8), None, DataPtr::null()) {
            let _ = job.wait();
            return Err(e);
        }
        job.wait()
    }

    /// Install the per-engine completion callback.
    pub fn register_callback(
        &self,
        callback: impl Fn(&TensorList, Option<&UserArg>) -> i32 + Send + Sync + 'static,
    ) {
        *self.core.callback.write() = Some(Arc::new(callback));
    }

    // ---- introspection -------------------------------------------------

    pub fn input_tensor_names(&self) -> &[String] {
        &self.core.input_order
    }

    pub fn output_tensor_names(&self) -> &[String] {
        &self.core.output_order
    }

    /// Summed input size in bytes (caller-facing layout)
    pub fn input_size(&self) -> u64 {
        self.core.input_total
    }

    /// Summed output size in bytes (caller-facing layout)
    pub fn output_size(&self) -> u64 {
        self.core.output_total
    }

    pub fn input_tensor_sizes(&self) -> &[u64] {
        &self.core.input_sizes
    }

    pub fn output_tensor_sizes(&self) -> &[u64] {
        &self.core.output_sizes
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Compiler version recorded in the package
    pub fn model_version(&self) -> u32 {
        self.compiler_version
    }

    pub fn file_format_version(&self) -> u32 {
        self.file_format_version
    }

    /// Compile flavor recorded by the compiler
    pub fn compile_type(&self) -> &str {
        &self.compile_type
    }

    /// Topological order of task names
    pub fn task_order(&self) -> &[String] {
        &self.task_order
    }

    pub fn is_multi_input(&self) -> bool {
        self.multi_input
    }

    pub fn has_dynamic_output(&self) -> bool {
        self.has_dynamic_output
    }

    /// Mean end-to-end latency over completed jobs, microseconds
    pub fn latency(&self) -> u64 {
        self.core.latency_stats.mean() as u64
    }

    /// Mean accelerator inference time over completed jobs, microseconds
    pub fn inference_time(&self) -> u64 {
        self.core.inference_stats.mean() as u64
    }

    /// Per-task rolling latency, microseconds, in topological order
    pub fn task_latencies(&self) -> Vec<(String, u64)> {
        self.core
            .tasks
            .iter()
            .map(|t| (t.name().to_string(), t.latency()))
            .collect()
    }

    /// Live worker thread count per CPU task
    pub fn cpu_worker_threads(&self) -> Vec<(String, usize)> {
        self.cpu_handles
            .iter()
            .filter_map(|h| {
                h.worker()
                    .ok()
                    .map(|w| (h.name().to_string(), w.thread_count()))
            })
            .collect()
    }

    pub fn register_event_handler(
        &self,
        handler: impl Fn(&crate::events::RuntimeEvent) + Send + Sync + 'static,
    ) {
        self.core.events.register(handler);
    }

    /// Tear down workers and devices. Called automatically on drop.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(model = %self.model_name, "disposing engine");
        for handle in &self.cpu_handles {
            handle.terminate();
        }
        self.core.device_pool.terminate_all();
        self.core.profiler.show();
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Probe the standard accelerator device nodes.
fn discover_adapters() -> Vec<Arc<dyn DriverAdapter>> {
    let mut adapters: Vec<Arc<dyn DriverAdapter>> = Vec::new();
    #[cfg(unix)]
    {
        for i in 0..16 {
            let path = format!("/dev/npu{i}");
            match crate::driver::chardev::CharDevice::open(&path) {
                Ok(device) => adapters.push(Arc::new(device)),
                Err(_) => break,
            }
        }
    }
    adapters
}
