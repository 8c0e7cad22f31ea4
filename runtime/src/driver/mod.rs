//! Driver adapter surface
//!
//! The runtime talks to the kernel driver only through [`DriverAdapter`];
//! this module is the only place that knows the request codes and payload
//! records. Two adapters ship: a Linux character-device adapter and an
//! in-process loopback device used by tests and bring-up.

pub mod loopback;

#[cfg(unix)]
pub mod chardev;

use bytemuck::{Pod, Zeroable};

use crate::error::Result;
use crate::tensor::DataPtr;

/// Command verbs understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceCommand {
    Identify = 0,
    GetStatus,
    ReadMem,
    WriteMem,
    NpuRunReq,
    NpuRunResp,
    Event,
    Terminate,
    TerminateEvent,
    CacheFlush,
    Reset,
    Start,
    UpdateFw,
    UploadFw,
    PcieInfo,
    Custom,
    Dump,
}

/// Outcome of a submit-style command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Done,
    /// The queue accepted the payload but cannot yet accept the descriptor;
    /// retry with the input-data field cleared.
    Busy,
}

/// Host-kernel transport verbs
pub trait DriverAdapter: Send + Sync {
    /// Synchronous command/response. `data` is the command payload record,
    /// updated in place for read-style commands.
    fn ioctl(&self, cmd: DeviceCommand, data: &mut [u8], sub_cmd: u32) -> Result<IoStatus>;

    /// Inject an inference request record
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Drain one response record
    fn read(&self, out: &mut [u8]) -> Result<usize>;

    /// Block until at least one event is pending
    fn poll(&self) -> Result<()>;

    /// Memory-mapped window into device DRAM; `None` when unavailable, in
    /// which case the core degrades to `ReadMem`/`WriteMem`.
    fn mmap(&self, offset: u64, size: usize) -> Option<DataPtr>;
}

/// Device identity returned by `Identify`
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DeviceInfo {
    /// Physical base of the device memory window
    pub mem_addr: u64,
    /// Size of the device memory window in bytes
    pub mem_size: u64,
    pub fw_version: u32,
    pub num_dma_ch: u32,
    pub interface: u32,
    pub variant: u32,
}

/// Device health snapshot returned by `GetStatus`
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DeviceStatus {
    pub voltage_mv: u32,
    pub clock_mhz: u32,
    pub temperature_c: i32,
    pub inflight: u32,
}

/// One host/device memory transfer descriptor
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct MemInfo {
    /// Host pointer of the staging buffer
    pub data: u64,
    /// Physical base of the device window
    pub base: u64,
    /// Byte offset within the device window
    pub offset: u64,
    /// Transfer size in bytes
    pub size: u64,
}

/// Inference submission record for the accelerator
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct AccRequest {
    pub input: MemInfo,
    pub output: MemInfo,
    /// Device offset of the register/command image
    pub cmd_offset: u64,
    /// Device offset of the weight blob
    pub weight_offset: u64,
    /// Device offset of the post-processing binary (PPCPU), else 0
    pub custom_offset: u64,
    pub req_id: u32,
    pub task_id: u32,
    pub model_type: u32,
    pub dma_ch: u32,
    pub proc_id: u32,
    pub _pad: u32,
}

/// Completion record read back from the accelerator
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DeviceResponse {
    pub req_id: u32,
    pub proc_id: u32,
    /// Firmware-measured inference time in microseconds
    pub inf_time: u32,
    /// Non-zero indicates a firmware error code
    pub status: u32,
    pub argmax: u16,
    pub _pad: u16,
    pub ppu_filter_num: u32,
    pub dma_ch: u32,
    pub _pad2: u32,
}

/// Event classes delivered through the `Event` command
pub const EVENT_NONE: u32 = 0;
pub const EVENT_ERROR: u32 = 1;
pub const EVENT_THROTTLE: u32 = 2;
pub const EVENT_RECOVERY: u32 = 3;
pub const EVENT_TERMINATE: u32 = 4;

/// Recovery actions within an `EVENT_RECOVERY` event
pub const RECOVERY_RMAP: u32 = 1;
pub const RECOVERY_WEIGHT: u32 = 2;
pub const RECOVERY_DONE: u32 = 3;

/// Asynchronous device event record
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DeviceEvent {
    pub event_type: u32,
    pub err_code: u32,
    pub recovery_action: u32,
    pub value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_are_padding_free() {
        assert_eq!(std::mem::size_of::<MemInfo>(), 32);
        assert_eq!(std::mem::size_of::<AccRequest>(), 112);
        assert_eq!(std::mem::size_of::<DeviceResponse>(), 32);
        assert_eq!(std::mem::size_of::<DeviceEvent>(), 16);
    }

    #[test]
    fn test_records_round_trip_through_bytes() {
        let mut req = AccRequest::default();
        req.req_id = 7;
        req.input.size = 128;
        let bytes = bytemuck::bytes_of(&req).to_vec();
        let back: AccRequest = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(back.req_id, 7);
        assert_eq!(back.input.size, 128);
    }
}
