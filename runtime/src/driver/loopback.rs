//! In-process loopback device
//!
//! A software accelerator behind the [`DriverAdapter`] trait. It backs the
//! integration tests and lets the pipeline be exercised end-to-end on hosts
//! without the hardware. Responses are programmable per task; the default
//! behavior echoes the input region into the output region.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{
    AccRequest, DeviceCommand, DeviceEvent, DeviceInfo, DeviceResponse, DeviceStatus,
    DriverAdapter, IoStatus, MemInfo, EVENT_TERMINATE,
};
use crate::error::{Error, Result};
use crate::model::NpuModelKind;
use crate::tensor::DataPtr;

/// Per-task completion behavior
#[derive(Debug, Clone)]
pub enum ResponsePlan {
    /// Copy the input region into the output region
    Echo,
    /// Place these bytes in the output region
    Normal(Vec<u8>),
    /// Respond with a 16-bit argmax value
    Argmax(u16),
    /// Respond with a filter count and these output-region bytes
    Ppu { filter_num: u32, payload: Vec<u8> },
}

impl ResponsePlan {
    fn model_kind(&self) -> NpuModelKind {
        match self {
            ResponsePlan::Echo | ResponsePlan::Normal(_) => NpuModelKind::Normal,
            ResponsePlan::Argmax(_) => NpuModelKind::Argmax,
            ResponsePlan::Ppu { .. } => NpuModelKind::Ppu,
        }
    }
}

struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> BlockingQueue<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.cv.notify_one();
    }

    fn pop_blocking(&self) -> T {
        let mut items = self.items.lock();
        while items.is_empty() {
            self.cv.wait(&mut items);
        }
        items.pop_front().expect("queue non-empty")
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.cv.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Software device state
pub struct LoopbackDriver {
    info: DeviceInfo,
    memory: Mutex<Vec<u8>>,
    plans: Mutex<HashMap<u32, ResponsePlan>>,
    responses: BlockingQueue<DeviceResponse>,
    events: BlockingQueue<DeviceEvent>,
    /// Every Nth submit reports busy once (exercises the retry path)
    busy_every: Option<u32>,
    submit_count: Mutex<u32>,
    /// Simulated per-inference latency
    latency: Duration,
    command_log: Mutex<Vec<DeviceCommand>>,
}

impl LoopbackDriver {
    pub fn new(mem_size: u64, num_dma_ch: u32) -> Self {
        Self {
            info: DeviceInfo {
                mem_addr: 0x1000_0000,
                mem_size,
                fw_version: 0x0108,
                num_dma_ch,
                interface: 0,
                variant: 0,
            },
            memory: Mutex::new(vec![0u8; mem_size as usize]),
            plans: Mutex::new(HashMap::new()),
            responses: BlockingQueue::new(),
            events: BlockingQueue::new(),
            busy_every: None,
            submit_count: Mutex::new(0),
            latency: Duration::ZERO,
            command_log: Mutex::new(Vec::new()),
        }
    }

    /// Program the completion behavior for a task
    pub fn plan_response(&self, task_id: u32, plan: ResponsePlan) {
        self.plans.lock().insert(task_id, plan);
    }

    /// Report busy once on every Nth submit
    pub fn with_busy_every(mut self, n: u32) -> Self {
        self.busy_every = Some(n.max(1));
        self
    }

    /// Simulate per-inference latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inject an asynchronous device event (test hook)
    pub fn inject_event(&self, event: DeviceEvent) {
        self.events.push(event);
    }

    /// Commands observed so far (test hook)
    pub fn command_log(&self) -> Vec<DeviceCommand> {
        self.command_log.lock().clone()
    }

    fn copy_in(&self, mem: &MemInfo) {
        if mem.data == 0 || mem.size == 0 {
            return;
        }
        let mut memory = self.memory.lock();
        let off = mem.offset as usize;
        let len = (mem.size as usize).min(memory.len().saturating_sub(off));
        let src = unsafe { std::slice::from_raw_parts(mem.data as *const u8, len) };
        memory[off..off + len].copy_from_slice(src);
    }

    fn copy_out(&self, mem: &MemInfo) {
        if mem.data == 0 || mem.size == 0 {
            return;
        }
        let memory = self.memory.lock();
        let off = mem.offset as usize;
        let len = (mem.size as usize).min(memory.len().saturating_sub(off));
        let dst = unsafe { std::slice::from_raw_parts_mut(mem.data as *mut u8, len) };
        dst.copy_from_slice(&memory[off..off + len]);
    }

    fn complete(&self, req: &AccRequest) {
        let plan = self
            .plans
            .lock()
            .get(&req.task_id)
            .cloned()
            .unwrap_or(ResponsePlan::Echo);

        let mut response = DeviceResponse {
            req_id: req.req_id,
            proc_id: req.proc_id,
            inf_time: self.latency.as_micros().max(1) as u32,
            status: 0,
            dma_ch: req.dma_ch,
            ..Default::default()
        };

        {
            let mut memory = self.memory.lock();
            match &plan {
                ResponsePlan::Echo => {
                    let n = (req.input.size.min(req.output.size) as usize)
                        .min(memory.len().saturating_sub(req.output.offset as usize));
                    let src = req.input.offset as usize;
                    let dst = req.output.offset as usize;
                    if src + n <= memory.len() {
                        memory.copy_within(src..src + n, dst);
                    }
                }
                ResponsePlan::Normal(bytes) | ResponsePlan::Ppu { payload: bytes, .. } => {
                    let dst = req.output.offset as usize;
                    let n = bytes.len().min(memory.len().saturating_sub(dst));
                    memory[dst..dst + n].copy_from_slice(&bytes[..n]);
                }
                ResponsePlan::Argmax(_) => {}
            }
        }

        match plan {
            ResponsePlan::Argmax(v) => response.argmax = v,
            ResponsePlan::Ppu { filter_num, .. } => response.ppu_filter_num = filter_num,
            _ => {}
        }
        debug!(req_id = req.req_id, kind = ?plan.model_kind(), "loopback completion");
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.responses.push(response);
    }

    fn submit(&self, req: &AccRequest) -> IoStatus {
        if let Some(n) = self.busy_every {
            let mut count = self.submit_count.lock();
            *count += 1;
            if *count % n == 0 && req.input.data != 0 {
                return IoStatus::Busy;
            }
        }
        self.complete(req);
        IoStatus::Done
    }
}

impl DriverAdapter for LoopbackDriver {
    fn ioctl(&self, cmd: DeviceCommand, data: &mut [u8], _sub_cmd: u32) -> Result<IoStatus> {
        self.command_log.lock().push(cmd);
        match cmd {
            DeviceCommand::Identify => {
                let bytes = bytemuck::bytes_of(&self.info);
                data.get_mut(..bytes.len())
                    .ok_or_else(|| Error::device_io("identify payload too small"))?
                    .copy_from_slice(bytes);
            }
            DeviceCommand::GetStatus => {
                let status = DeviceStatus {
                    voltage_mv: 750,
                    clock_mhz: 1000,
                    temperature_c: 45,
                    inflight: 0,
                };
                let bytes = bytemuck::bytes_of(&status);
                data.get_mut(..bytes.len())
                    .ok_or_else(|| Error::device_io("status payload too small"))?
                    .copy_from_slice(bytes);
            }
            DeviceCommand::WriteMem => {
                let mem: MemInfo = bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<MemInfo>()]);
                self.copy_in(&mem);
            }
            DeviceCommand::ReadMem => {
                let mem: MemInfo = bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<MemInfo>()]);
                self.copy_out(&mem);
            }
            DeviceCommand::NpuRunReq => {
                let req: AccRequest =
                    bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<AccRequest>()]);
                return Ok(self.submit(&req));
            }
            DeviceCommand::NpuRunResp => {
                let response = self.responses.pop_blocking();
                let bytes = bytemuck::bytes_of(&response);
                data.get_mut(..bytes.len())
                    .ok_or_else(|| Error::device_io("response payload too small"))?
                    .copy_from_slice(bytes);
            }
            DeviceCommand::Event => {
                let event = self.events.pop_blocking();
                let bytes = bytemuck::bytes_of(&event);
                data.get_mut(..bytes.len())
                    .ok_or_else(|| Error::device_io("event payload too small"))?
                    .copy_from_slice(bytes);
            }
            DeviceCommand::Terminate => {
                // Unblock every output thread with a response nobody owns
                let dummies = self.info.num_dma_ch.max(1) * 2;
                for _ in 0..dummies {
                    self.responses.push(DeviceResponse::default());
                }
            }
            DeviceCommand::TerminateEvent => {
                self.events.push(DeviceEvent {
                    event_type: EVENT_TERMINATE,
                    ..Default::default()
                });
            }
            DeviceCommand::CacheFlush
            | DeviceCommand::Reset
            | DeviceCommand::Start
            | DeviceCommand::UpdateFw
            | DeviceCommand::UploadFw
            | DeviceCommand::PcieInfo
            | DeviceCommand::Custom
            | DeviceCommand::Dump => {}
        }
        Ok(IoStatus::Done)
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < std::mem::size_of::<AccRequest>() {
            return Err(Error::device_io("short inference record"));
        }
        let req: AccRequest = bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<AccRequest>()]);
        self.submit(&req);
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> Result<usize> {
        match self.responses.pop_timeout(Duration::from_millis(100)) {
            Some(response) => {
                let bytes = bytemuck::bytes_of(&response);
                let n = bytes.len().min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn poll(&self) -> Result<()> {
        while self.events.is_empty() && self.responses.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn mmap(&self, _offset: u64, _size: usize) -> Option<DataPtr> {
        None
    }
}
