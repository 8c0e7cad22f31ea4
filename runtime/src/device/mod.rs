//! Device core
//!
//! One `Device` owns one accelerator: identify, register tasks, move
//! memory, submit inferences and dispatch completions. Three cooperating
//! workers drive the I/O pipeline: a single input handler fed by a FIFO,
//! `num_dma_ch` output handlers blocked on completion records, and one
//! event handler long-polling the driver.

pub mod cache;
pub mod event;
pub mod input;
pub mod memory;
pub mod output;
pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{align_up, RuntimeConfig, MEM_ALIGN};
use crate::driver::{
    AccRequest, DeviceCommand, DeviceInfo, DeviceResponse, DeviceStatus, DriverAdapter, IoStatus,
    MemInfo,
};
use crate::error::{Error, Result};
use crate::events::EventDispatcher;
use crate::request::Request;
use crate::task::Task;

use cache::TaskCacheManager;
use memory::DeviceMemory;
use pool::DeviceSignal;

/// Depth of the input handler FIFO
const INPUT_QUEUE_DEPTH: usize = 256;

/// Completion plumbing back into the scheduling layer
pub trait ResponseSink: Send + Sync {
    /// A completion record arrived for a request owned by this process
    fn process(&self, device: &Arc<Device>, response: DeviceResponse);
    /// A request failed before producing a response
    fn fail(&self, device: &Arc<Device>, request_id: usize, message: String);
}

struct RegisteredTask {
    task: Arc<Task>,
    rmap_offset: u64,
    weight_offset: u64,
    ppu_offset: Option<u64>,
    template: AccRequest,
}

pub struct Device {
    id: usize,
    name: String,
    adapter: Arc<dyn DriverAdapter>,
    info: DeviceInfo,
    proc_id: u32,
    config: RuntimeConfig,
    events: Arc<EventDispatcher>,
    memory: Mutex<DeviceMemory>,
    caches: Mutex<TaskCacheManager>,
    registered: RwLock<HashMap<u32, RegisteredTask>>,
    /// In-flight submission records keyed by request id
    inflight: DashMap<u32, AccRequest>,
    load: AtomicUsize,
    blocked: AtomicBool,
    stop: Arc<AtomicBool>,
    input_tx: Mutex<Option<Sender<usize>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    signal: Arc<DeviceSignal>,
    /// Memory-mapped DRAM window; transfers fall back to the read/write
    /// commands when the driver cannot map it
    dram_window: Option<crate::tensor::DataPtr>,
}

impl Device {
    /// Identify the accelerator behind `adapter` and set up its memory
    /// window.
    pub fn new(
        id: usize,
        adapter: Arc<dyn DriverAdapter>,
        config: RuntimeConfig,
        events: Arc<EventDispatcher>,
        signal: Arc<DeviceSignal>,
    ) -> Result<Arc<Self>> {
        let mut raw = [0u8; std::mem::size_of::<DeviceInfo>()];
        adapter.ioctl(DeviceCommand::Identify, &mut raw, 0)?;
        let info: DeviceInfo = bytemuck::pod_read_unaligned(&raw);
        if info.mem_size == 0 {
            return Err(Error::DeviceIo(format!("device {id} reports no memory")));
        }
        let dram_window = adapter.mmap(0, info.mem_size as usize);
        if dram_window.is_some() {
            debug!(device = id, "device DRAM window mapped");
        }
        info!(
            device = id,
            mem_size = info.mem_size,
            dma_channels = info.num_dma_ch,
            fw_version = info.fw_version,
            "device identified"
        );
        Ok(Arc::new(Self {
            id,
            name: format!("npu{id}"),
            adapter,
            info,
            proc_id: std::process::id(),
            config,
            events,
            memory: Mutex::new(DeviceMemory::new(info.mem_addr, info.mem_size)),
            caches: Mutex::new(TaskCacheManager::new()),
            registered: RwLock::new(HashMap::new()),
            inflight: DashMap::new(),
            load: AtomicUsize::new(0),
            blocked: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            input_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            signal,
            dram_window,
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn proc_id(&self) -> u32 {
        self.proc_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Claim one unit of capacity
    pub fn pick(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    /// Give back one unit of capacity and wake device waiters
    pub fn callback(&self) {
        self.load.fetch_sub(1, Ordering::AcqRel);
        self.signal.notify();
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn block(&self) {
        self.blocked.store(true, Ordering::Release);
        warn!(device = self.id, "device blocked");
        self.signal.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Generic command helper
    pub fn process(&self, cmd: DeviceCommand, data: &mut [u8], sub_cmd: u32) -> Result<IoStatus> {
        self.adapter.ioctl(cmd, data, sub_cmd)
    }

    /// Health snapshot
    pub fn status(&self) -> Result<DeviceStatus> {
        let mut raw = [0u8; std::mem::size_of::<DeviceStatus>()];
        self.adapter.ioctl(DeviceCommand::GetStatus, &mut raw, 0)?;
        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    fn window_range(&self, mem: &MemInfo) -> Option<(crate::tensor::DataPtr, usize)> {
        let window = self.dram_window?;
        if mem.data == 0 || mem.size == 0 {
            return None;
        }
        let end = mem.offset.checked_add(mem.size)?;
        if end > self.info.mem_size {
            return None;
        }
        Some((window.add(mem.offset as usize), mem.size as usize))
    }

    /// Copy host bytes into device memory, through the mapped window when
    /// one exists.
    pub fn write_mem(&self, mem: MemInfo) -> Result<()> {
        if let Some((dst, len)) = self.window_range(&mem) {
            unsafe { std::ptr::copy_nonoverlapping(mem.data as *const u8, dst.0, len) };
            return Ok(());
        }
        let mut raw = bytemuck::bytes_of(&mem).to_vec();
        match self.adapter.ioctl(DeviceCommand::WriteMem, &mut raw, 0)? {
            IoStatus::Done => Ok(()),
            IoStatus::Busy => Err(Error::DeviceIo(format!(
                "device {}: memory write rejected",
                self.id
            ))),
        }
    }

    /// Copy device memory into host bytes, through the mapped window when
    /// one exists.
    pub fn read_mem(&self, mem: MemInfo) -> Result<()> {
        if let Some((src, len)) = self.window_range(&mem) {
            unsafe { std::ptr::copy_nonoverlapping(src.0, mem.data as *mut u8, len) };
            return Ok(());
        }
        let mut raw = bytemuck::bytes_of(&mem).to_vec();
        match self.adapter.ioctl(DeviceCommand::ReadMem, &mut raw, 0)? {
            IoStatus::Done => Ok(()),
            IoStatus::Busy => Err(Error::DeviceIo(format!(
                "device {}: memory read rejected",
                self.id
            ))),
        }
    }

    fn mem_info(&self, offset: u64, size: u64, host: *const u8) -> MemInfo {
        MemInfo {
            data: host as u64,
            base: self.info.mem_addr,
            offset,
            size,
        }
    }

    /// Register an NPU task: place its long-lived regions with backward
    /// allocation, write and verify them, build the submission template and
    /// pre-warm the per-task memory cache.
    pub fn register_task(&self, task: &Arc<Task>) -> Result<()> {
        let npu = task
            .info()
            .npu
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation(format!("task '{}' is not NPU", task.name())))?;
        let task_id = task.id();

        let (weight_offset, rmap_offset, ppu_offset) = {
            let mut memory = self.memory.lock();
            let weight_offset = memory.allocate_backward(npu.weight.len().max(1) as u64)?;
            let rmap_offset = memory.allocate_backward(npu.rmap.len().max(1) as u64)?;
            let ppu_offset = match &npu.ppu_binary {
                Some(bin) if !bin.is_empty() => {
                    Some(memory.allocate_backward(bin.len() as u64)?)
                }
                _ => None,
            };
            (weight_offset, rmap_offset, ppu_offset)
        };

        self.write_and_verify(rmap_offset, &npu.rmap, "rmap")?;
        self.write_and_verify(weight_offset, &npu.weight, "weight")?;
        if let (Some(offset), Some(bin)) = (ppu_offset, npu.ppu_binary.as_ref()) {
            self.write_and_verify(offset, bin, "ppu binary")?;
        }

        let template = AccRequest {
            input: MemInfo {
                data: 0,
                base: self.info.mem_addr,
                offset: 0,
                size: npu.encoded_input_size,
            },
            output: MemInfo {
                data: 0,
                base: self.info.mem_addr,
                offset: 0,
                size: npu.encoded_output_size,
            },
            cmd_offset: rmap_offset,
            weight_offset,
            custom_offset: ppu_offset.unwrap_or(0),
            task_id,
            model_type: npu.kind as u32,
            proc_id: self.proc_id,
            ..Default::default()
        };

        let block = task.inference_slot_size().max(MEM_ALIGN);
        let cached = {
            let mut memory = self.memory.lock();
            self.caches.lock().register_with_fallback(
                &mut memory,
                task_id,
                block,
                task.buffer_count(),
            )
        };
        if cached == 0 {
            return Err(Error::InvalidOperation(format!(
                "device {}: cannot cache any inference slot for task '{}'",
                self.id,
                task.name()
            )));
        }
        if cached < task.buffer_count() {
            warn!(
                device = self.id,
                task = %task.name(),
                requested = task.buffer_count(),
                cached,
                "inference slot cache registered below requested count"
            );
        }

        self.registered.write().insert(
            task_id,
            RegisteredTask {
                task: Arc::clone(task),
                rmap_offset,
                weight_offset,
                ppu_offset,
                template,
            },
        );
        debug!(device = self.id, task = %task.name(), "task registered");
        Ok(())
    }

    fn write_and_verify(&self, offset: u64, blob: &[u8], what: &str) -> Result<()> {
        if blob.is_empty() {
            return Ok(());
        }
        self.write_mem(self.mem_info(offset, blob.len() as u64, blob.as_ptr()))?;
        let mut readback = vec![0u8; blob.len()];
        self.read_mem(self.mem_info(offset, blob.len() as u64, readback.as_ptr()))?;
        if readback != blob {
            return Err(Error::DeviceIo(format!(
                "device {}: {what} integrity check failed",
                self.id
            )));
        }
        Ok(())
    }

    /// Release a task's cache ring and long-lived regions.
    pub fn unregister_task(&self, task_id: u32) {
        let Some(entry) = self.registered.write().remove(&task_id) else {
            return;
        };
        let mut memory = self.memory.lock();
        self.caches.lock().unregister(&mut memory, task_id);
        let _ = memory.deallocate(entry.rmap_offset);
        let _ = memory.deallocate(entry.weight_offset);
        if let Some(offset) = entry.ppu_offset {
            let _ = memory.deallocate(offset);
        }
        debug!(device = self.id, task_id, "task unregistered");
    }

    /// Build the submission record for a request and hand it to the input
    /// worker. The caller has already staged the encoded input.
    pub fn inference_request(&self, req: &Arc<Request>) -> Result<()> {
        let task = req.task();
        let task_id = task.id();
        let mut acc = self
            .registered
            .read()
            .get(&task_id)
            .map(|r| r.template)
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "task '{}' not registered on device {}",
                    task.name(),
                    self.id
                ))
            })?;
        let npu = task.info().npu.as_ref().expect("registered task is NPU");

        let slot = {
            let mut memory = self.memory.lock();
            self.caches
                .lock()
                .get(&mut memory, task_id, task.inference_slot_size().max(MEM_ALIGN))?
        };

        acc.req_id = req.id() as u32;
        acc.input.data = req.encoded_inputs().0 as u64;
        acc.input.offset = slot;
        let output_region = if npu.output_all_offset == 0 {
            slot + align_up(npu.encoded_input_size, MEM_ALIGN)
        } else {
            slot + npu.output_all_offset
        };
        acc.output.offset = output_region + npu.last_output_offset;
        acc.output.data = req.encoded_outputs().0 as u64;

        req.set_acc(acc);
        self.inflight.insert(acc.req_id, acc);

        let sent = self
            .input_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("device {} not started", self.id)))
            .and_then(|tx| {
                tx.send(req.id()).map_err(|_| {
                    Error::InvalidOperation(format!("device {} input queue closed", self.id))
                })
            });
        if let Err(e) = sent {
            self.inflight.remove(&acc.req_id);
            let mut memory = self.memory.lock();
            let _ = self.caches.lock().put(&mut memory, task_id, slot);
            return Err(e);
        }
        Ok(())
    }

    pub fn inflight_get(&self, req_id: u32) -> Option<AccRequest> {
        self.inflight.get(&req_id).map(|e| *e)
    }

    /// Pop the in-flight record, recycle its inference slot and release one
    /// unit of capacity.
    pub fn finish_request(&self, req_id: u32) -> Option<AccRequest> {
        let (_, acc) = self.inflight.remove(&req_id)?;
        {
            let mut memory = self.memory.lock();
            let _ = self.caches.lock().put(&mut memory, acc.task_id, acc.input.offset);
        }
        self.callback();
        Some(acc)
    }

    /// Rewrite every registered task's parameter regions (recovery path).
    pub fn rewrite_params(&self, rmap: bool, weight: bool) -> Result<()> {
        let registered = self.registered.read();
        for entry in registered.values() {
            let npu = entry.task.info().npu.as_ref().expect("registered task is NPU");
            if rmap && !npu.rmap.is_empty() {
                self.write_mem(self.mem_info(
                    entry.rmap_offset,
                    npu.rmap.len() as u64,
                    npu.rmap.as_ptr(),
                ))?;
            }
            if weight && !npu.weight.is_empty() {
                self.write_mem(self.mem_info(
                    entry.weight_offset,
                    npu.weight.len() as u64,
                    npu.weight.as_ptr(),
                ))?;
            }
        }
        Ok(())
    }

    /// Task metadata for the output path
    pub fn registered_task(&self, task_id: u32) -> Option<Arc<Task>> {
        self.registered.read().get(&task_id).map(|r| Arc::clone(&r.task))
    }

    /// Spawn the input, output and event workers.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn ResponseSink>) {
        let (tx, rx) = bounded::<usize>(INPUT_QUEUE_DEPTH);
        *self.input_tx.lock() = Some(tx);

        let mut threads = self.threads.lock();
        {
            let device = Arc::clone(self);
            let sink = Arc::clone(&sink);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}_input", self.name))
                    .spawn(move || input::run(device, rx, sink))
                    .expect("spawn input worker"),
            );
        }
        for ch in 0..self.info.num_dma_ch.max(1) {
            let device = Arc::clone(self);
            let sink = Arc::clone(&sink);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}_output{ch}", self.name))
                    .spawn(move || output::run(device, ch as usize, sink))
                    .expect("spawn output worker"),
            );
        }
        {
            let device = Arc::clone(self);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}_event", self.name))
                    .spawn(move || event::run(device))
                    .expect("spawn event worker"),
            );
        }
        debug!(device = self.id, "device workers started");
    }

    /// Stop the pipeline: drain the FIFO, unblock the waiters, join every
    /// worker thread.
    pub fn terminate(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.input_tx.lock() = None;
        let _ = self.adapter.ioctl(DeviceCommand::Terminate, &mut [], 0);
        for _ in 0..self.info.num_dma_ch.max(1) {
            let _ = self.adapter.ioctl(DeviceCommand::TerminateEvent, &mut [], 0);
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        info!(device = self.id, "device terminated");
    }

    /// Issue `Start` after a recovery completes
    pub fn start_firmware(&self, sub_cmd: u32) -> Result<()> {
        self.adapter.ioctl(DeviceCommand::Start, &mut [], sub_cmd)?;
        Ok(())
    }

    /// Dump firmware diagnostics after an error event
    pub fn dump_diagnostics(&self) {
        let mut dump = vec![0u8; 4096];
        let _ = self.adapter.ioctl(DeviceCommand::Dump, &mut dump, 0);
        let _ = self.adapter.ioctl(DeviceCommand::PcieInfo, &mut [], 0);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Layout, TransposeKind};
    use crate::driver::loopback::LoopbackDriver;
    use crate::driver::{DeviceEvent, EVENT_RECOVERY, RECOVERY_RMAP};
    use crate::model::{NpuModelKind, NpuSubGraph, Processor, SubGraphInfo, TensorInfo};
    use crate::tensor::{DataType, MemoryKind};

    struct NoopSink;

    impl ResponseSink for NoopSink {
        fn process(&self, device: &Arc<Device>, response: DeviceResponse) {
            device.finish_request(response.req_id);
        }
        fn fail(&self, _device: &Arc<Device>, _request_id: usize, _message: String) {}
    }

    fn npu_task() -> Arc<Task> {
        let tinfo = |name: &str, size: i64| TensorInfo {
            name: name.into(),
            dtype: DataType::Uint8,
            shape: vec![1, size],
            dtype_encoded: DataType::Uint8,
            shape_encoded: vec![1, size],
            layout: Layout::Identity,
            align_unit: 64,
            transpose: TransposeKind::None,
            scale: 1.0,
            bias: 0.0,
            encoded_offset: 0,
            encoded_size: size as u64,
            memory_kind: MemoryKind::Dram,
        };
        let info = SubGraphInfo {
            name: "net".into(),
            processor: Processor::Npu,
            inputs: vec![tinfo("in", 64)],
            outputs: vec![tinfo("out", 64)],
            npu: Some(NpuSubGraph {
                kind: NpuModelKind::Normal,
                rmap: vec![0x11; 96],
                weight: vec![0x22; 160],
                ppu_binary: None,
                encoded_input_size: 64,
                encoded_output_size: 64,
                output_mem_size: 64,
                output_all_offset: 0,
                last_output_offset: 0,
                ppu_filter_max: 16,
            }),
            cpu: None,
        };
        Task::new(0, info, vec![0], 2, None).unwrap()
    }

    fn test_device(driver: Arc<LoopbackDriver>) -> Arc<Device> {
        Device::new(
            0,
            driver,
            RuntimeConfig::default(),
            Arc::new(EventDispatcher::new()),
            Arc::new(DeviceSignal::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_identify_and_status() {
        let device = test_device(Arc::new(LoopbackDriver::new(1 << 20, 2)));
        assert_eq!(device.info().num_dma_ch, 2);
        let status = device.status().unwrap();
        assert!(status.clock_mhz > 0);
    }

    #[test]
    fn test_register_unregister_restores_memory() {
        let device = test_device(Arc::new(LoopbackDriver::new(1 << 20, 1)));
        let free_before = device.memory.lock().free_bytes();
        let task = npu_task();
        device.register_task(&task).unwrap();
        assert!(device.memory.lock().free_bytes() < free_before);
        device.unregister_task(task.id());
        assert_eq!(device.memory.lock().free_bytes(), free_before);
    }

    #[test]
    fn test_recovery_event_rewrites_and_restarts() {
        let driver = Arc::new(LoopbackDriver::new(1 << 20, 1));
        let device = test_device(Arc::clone(&driver));
        device.register_task(&npu_task()).unwrap();
        device.start(Arc::new(NoopSink));

        driver.inject_event(DeviceEvent {
            event_type: EVENT_RECOVERY,
            recovery_action: RECOVERY_RMAP,
            ..Default::default()
        });
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if driver
                .command_log()
                .iter()
                .any(|c| matches!(c, DeviceCommand::Start))
            {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        device.terminate();
        assert!(driver
            .command_log()
            .iter()
            .any(|c| matches!(c, DeviceCommand::Start)));
    }

    #[test]
    fn test_load_accounting() {
        let device = test_device(Arc::new(LoopbackDriver::new(1 << 20, 1)));
        assert_eq!(device.load(), 0);
        device.pick();
        device.pick();
        assert_eq!(device.load(), 2);
        device.callback();
        assert_eq!(device.load(), 1);
    }
}
