//! Task
//!
//! One node of the task graph: its descriptors, per-task buffer pools, and
//! metric windows. Tasks are immutable after model load; only their pools
//! and windows are mutated at runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::buffer::FixedSizeBufferPool;
use crate::cpu::CpuTaskHandle;
use crate::error::{Error, Result};
use crate::model::{NpuModelKind, Processor, SubGraphInfo};
use crate::tensor::{DataPtr, Tensor};

/// The buffer triple owned by one in-flight request
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSet {
    pub encoded_input: DataPtr,
    pub output: DataPtr,
    pub encoded_output: DataPtr,
}

const METRIC_WINDOW: usize = 100;

/// One node in the task graph
pub struct Task {
    id: u32,
    info: SubGraphInfo,
    device_ids: Vec<usize>,
    buffer_count: usize,

    is_head: AtomicBool,
    is_tail: AtomicBool,
    prevs: RwLock<Vec<Arc<Task>>>,
    nexts: RwLock<Vec<Arc<Task>>>,

    /// Staging for the device-layout input (NPU tasks)
    encoded_input_pool: Option<FixedSizeBufferPool>,
    /// User-layout output staging
    output_pool: FixedSizeBufferPool,
    /// Device-layout output staging (NPU tasks)
    encoded_output_pool: Option<FixedSizeBufferPool>,

    /// Cumulative byte offsets of the inputs within one input buffer
    input_offsets: Vec<u64>,
    /// Cumulative byte offsets of the outputs within one output buffer
    output_offsets: Vec<u64>,

    cpu: Option<Arc<CpuTaskHandle>>,

    latency_window: Mutex<VecDeque<u64>>,
    inference_time_window: Mutex<VecDeque<u64>>,
    last_output: Mutex<Vec<Tensor>>,
    inference_count: AtomicU64,
    /// Byte offset of this task's first output within the model-global
    /// output buffer; meaningful for tail tasks only
    tail_offset: AtomicI64,
}

impl Task {
    pub fn new(
        id: u32,
        info: SubGraphInfo,
        device_ids: Vec<usize>,
        buffer_count: usize,
        cpu: Option<Arc<CpuTaskHandle>>,
    ) -> Result<Arc<Self>> {
        let device_count = device_ids.len().max(1);
        let pool_slots = device_count * buffer_count;

        let output_size = info.output_size().max(1) as usize;
        let output_pool = FixedSizeBufferPool::new(output_size, pool_slots)?;

        let (encoded_input_pool, encoded_output_pool) = match (&info.processor, &info.npu) {
            (Processor::Npu, Some(npu)) => (
                Some(FixedSizeBufferPool::new(
                    npu.encoded_input_size.max(1) as usize,
                    pool_slots,
                )?),
                Some(FixedSizeBufferPool::new(
                    npu.encoded_output_size.max(1) as usize,
                    pool_slots,
                )?),
            ),
            (Processor::Cpu, _) => (None, None),
            (Processor::Npu, None) => {
                return Err(Error::InvalidModel(format!(
                    "NPU task '{}' has no register map section",
                    info.name
                )));
            }
        };

        let mut input_offsets = Vec::with_capacity(info.inputs.len());
        let mut acc = 0u64;
        for t in &info.inputs {
            input_offsets.push(acc);
            acc += t.user_size();
        }
        let mut output_offsets = Vec::with_capacity(info.outputs.len());
        let mut acc = 0u64;
        for t in &info.outputs {
            output_offsets.push(acc);
            acc += t.user_size();
        }

        debug!(task = %info.name, id, pool_slots, "task constructed");
        Ok(Arc::new(Self {
            id,
            info,
            device_ids,
            buffer_count,
            is_head: AtomicBool::new(false),
            is_tail: AtomicBool::new(false),
            prevs: RwLock::new(Vec::new()),
            nexts: RwLock::new(Vec::new()),
            encoded_input_pool,
            output_pool,
            encoded_output_pool,
            input_offsets,
            output_offsets,
            cpu,
            latency_window: Mutex::new(VecDeque::new()),
            inference_time_window: Mutex::new(VecDeque::new()),
            last_output: Mutex::new(Vec::new()),
            inference_count: AtomicU64::new(0),
            tail_offset: AtomicI64::new(0),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn processor(&self) -> Processor {
        self.info.processor
    }

    pub fn info(&self) -> &SubGraphInfo {
        &self.info
    }

    pub fn npu_kind(&self) -> Option<NpuModelKind> {
        self.info.npu.as_ref().map(|n| n.kind)
    }

    pub fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn cpu_handle(&self) -> Option<&Arc<CpuTaskHandle>> {
        self.cpu.as_ref()
    }

    pub fn set_head(&self) {
        self.is_head.store(true, Ordering::Release);
    }

    pub fn set_tail(&self) {
        self.is_tail.store(true, Ordering::Release);
    }

    pub fn is_head(&self) -> bool {
        self.is_head.load(Ordering::Acquire)
    }

    pub fn is_tail(&self) -> bool {
        self.is_tail.load(Ordering::Acquire)
    }

    pub fn add_prev(&self, task: Arc<Task>) {
        self.prevs.write().push(task);
    }

    pub fn add_next(&self, task: Arc<Task>) {
        self.nexts.write().push(task);
    }

    pub fn prevs(&self) -> Vec<Arc<Task>> {
        self.prevs.read().clone()
    }

    pub fn nexts(&self) -> Vec<Arc<Task>> {
        self.nexts.read().clone()
    }

    /// Total input size in the caller-facing layout
    pub fn input_size(&self) -> u64 {
        self.info.input_size()
    }

    /// Total output size in the caller-facing layout
    pub fn output_size(&self) -> u64 {
        self.info.output_size()
    }

    pub fn encoded_input_size(&self) -> u64 {
        self.info.npu.as_ref().map(|n| n.encoded_input_size).unwrap_or(0)
    }

    pub fn encoded_output_size(&self) -> u64 {
        self.info.npu.as_ref().map(|n| n.encoded_output_size).unwrap_or(0)
    }

    /// Device memory one inference slot of this task occupies
    pub fn inference_slot_size(&self) -> u64 {
        match &self.info.npu {
            Some(npu) => {
                crate::config::align_up(npu.encoded_input_size, crate::config::MEM_ALIGN)
                    + npu.output_mem_size
            }
            None => 0,
        }
    }

    /// Input descriptors bound at cumulative offsets from `base`
    pub fn inputs(&self, base: DataPtr) -> Vec<Tensor> {
        self.info
            .inputs
            .iter()
            .zip(&self.input_offsets)
            .map(|(info, &off)| {
                let mut t = info.to_tensor();
                if !base.is_null() {
                    t.set_data(base.add(off as usize));
                }
                t
            })
            .collect()
    }

    /// Output descriptors bound at cumulative offsets from `base`
    pub fn outputs(&self, base: DataPtr) -> Vec<Tensor> {
        self.info
            .outputs
            .iter()
            .zip(&self.output_offsets)
            .map(|(info, &off)| {
                let mut t = info.to_tensor();
                if !base.is_null() {
                    t.set_data(base.add(off as usize));
                }
                t
            })
            .collect()
    }

    pub fn output_offset_of(&self, name: &str) -> Option<u64> {
        self.info
            .outputs
            .iter()
            .position(|t| t.name == name)
            .map(|i| self.output_offsets[i])
    }

    /// Grab one slot from each pool in a fixed order. On any failure the
    /// already-acquired slots are released before the error propagates.
    pub fn acquire_all_buffers(&self) -> Result<BufferSet> {
        let mut set = BufferSet::default();
        if let Some(pool) = &self.encoded_input_pool {
            set.encoded_input = pool.acquire()?;
        }
        match self.output_pool.acquire() {
            Ok(p) => set.output = p,
            Err(e) => {
                self.release_all_buffers(&set);
                return Err(e);
            }
        }
        if let Some(pool) = &self.encoded_output_pool {
            match pool.acquire() {
                Ok(p) => set.encoded_output = p,
                Err(e) => {
                    self.release_all_buffers(&set);
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    /// Release in reverse order; null entries from partial acquires are
    /// tolerated.
    pub fn release_all_buffers(&self, set: &BufferSet) {
        if let Some(pool) = &self.encoded_output_pool {
            if !set.encoded_output.is_null() {
                let _ = pool.release(set.encoded_output);
            }
        }
        if !set.output.is_null() {
            let _ = self.output_pool.release(set.output);
        }
        if let Some(pool) = &self.encoded_input_pool {
            if !set.encoded_input.is_null() {
                let _ = pool.release(set.encoded_input);
            }
        }
    }

    pub fn release_output_buffer(&self, ptr: DataPtr) {
        if !ptr.is_null() {
            let _ = self.output_pool.release(ptr);
        }
    }

    pub fn available_buffers(&self) -> usize {
        self.output_pool.available()
    }

    pub fn push_latency(&self, micros: u64) {
        let mut window = self.latency_window.lock();
        if window.len() == METRIC_WINDOW {
            window.pop_front();
        }
        window.push_back(micros);
    }

    pub fn push_inference_time(&self, micros: u64) {
        let mut window = self.inference_time_window.lock();
        if window.len() == METRIC_WINDOW {
            window.pop_front();
        }
        window.push_back(micros);
    }

    /// Mean of the rolling latency window in microseconds
    pub fn latency(&self) -> u64 {
        let window = self.latency_window.lock();
        if window.is_empty() {
            return 0;
        }
        window.iter().sum::<u64>() / window.len() as u64
    }

    /// Mean of the rolling NPU inference-time window in microseconds
    pub fn inference_time(&self) -> u64 {
        let window = self.inference_time_window.lock();
        if window.is_empty() {
            return 0;
        }
        window.iter().sum::<u64>() / window.len() as u64
    }

    pub fn set_last_output(&self, outputs: Vec<Tensor>) {
        *self.last_output.lock() = outputs;
    }

    pub fn last_output(&self) -> Vec<Tensor> {
        self.last_output.lock().clone()
    }

    pub fn increment_inference_count(&self) -> u64 {
        self.inference_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::Relaxed)
    }

    pub fn set_tail_offset(&self, offset: i64) {
        self.tail_offset.store(offset, Ordering::Release);
    }

    pub fn tail_offset(&self) -> i64 {
        self.tail_offset.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Layout, TransposeKind};
    use crate::model::TensorInfo;
    use crate::tensor::{DataType, MemoryKind};

    fn tensor_info(name: &str, shape: Vec<i64>, dtype: DataType) -> TensorInfo {
        TensorInfo {
            name: name.into(),
            dtype,
            shape: shape.clone(),
            dtype_encoded: dtype,
            shape_encoded: shape,
            layout: Layout::Identity,
            align_unit: 64,
            transpose: TransposeKind::None,
            scale: 1.0,
            bias: 0.0,
            encoded_offset: 0,
            encoded_size: 0,
            memory_kind: MemoryKind::Dram,
        }
    }

    fn cpu_task(buffer_count: usize) -> Arc<Task> {
        let info = SubGraphInfo {
            name: "t0".into(),
            processor: Processor::Cpu,
            inputs: vec![tensor_info("a", vec![1, 8], DataType::Float32)],
            outputs: vec![
                tensor_info("x", vec![1, 256], DataType::Uint8),
                tensor_info("y", vec![1, 128], DataType::Uint8),
            ],
            npu: None,
            cpu: Some(crate::model::CpuSubGraph { model: vec![] }),
        };
        Task::new(0, info, vec![0], buffer_count, None).unwrap()
    }

    #[test]
    fn test_offsets_and_sizes() {
        let task = cpu_task(2);
        assert_eq!(task.input_size(), 32);
        assert_eq!(task.output_size(), 384);
        assert_eq!(task.output_offset_of("x"), Some(0));
        assert_eq!(task.output_offset_of("y"), Some(256));
        assert_eq!(task.output_offset_of("z"), None);
    }

    #[test]
    fn test_acquire_release_cycle() {
        let task = cpu_task(2);
        assert_eq!(task.available_buffers(), 2);
        let a = task.acquire_all_buffers().unwrap();
        let b = task.acquire_all_buffers().unwrap();
        assert!(a.encoded_input.is_null());
        assert!(!a.output.is_null());
        assert_eq!(task.available_buffers(), 0);
        task.release_all_buffers(&a);
        task.release_all_buffers(&b);
        assert_eq!(task.available_buffers(), 2);
    }

    #[test]
    fn test_release_tolerates_partial_set() {
        let task = cpu_task(1);
        let partial = BufferSet::default();
        task.release_all_buffers(&partial);
        assert_eq!(task.available_buffers(), 1);
    }

    #[test]
    fn test_metric_windows_roll() {
        let task = cpu_task(1);
        for i in 0..(METRIC_WINDOW as u64 + 50) {
            task.push_latency(i);
        }
        assert!(task.latency() > 0);
        assert_eq!(task.latency_window.lock().len(), METRIC_WINDOW);
    }

    #[test]
    fn test_bound_tensors() {
        let task = cpu_task(1);
        let set = task.acquire_all_buffers().unwrap();
        let outs = task.outputs(set.output);
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[1].data(), set.output.add(256));
        task.release_all_buffers(&set);
    }
}
