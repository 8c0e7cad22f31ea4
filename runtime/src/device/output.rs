//! Output handler
//!
//! One thread per DMA channel waits on completion records. Responses
//! belonging to other processes are ignored; a non-zero firmware status
//! dumps diagnostics and fails the owning request. Successful completions
//! are handed to the scheduling layer for decode and fan-out.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{Device, ResponseSink};
use crate::driver::{DeviceCommand, DeviceResponse};
use crate::events::{EventCode, EventKind, EventLevel, RuntimeEvent};

pub(super) fn run(device: Arc<Device>, channel: usize, sink: Arc<dyn ResponseSink>) {
    debug!(device = device.id(), channel, "output handler entry");
    loop {
        if device.is_stopped() {
            break;
        }
        let mut raw = [0u8; std::mem::size_of::<DeviceResponse>()];
        if let Err(e) = device.process(DeviceCommand::NpuRunResp, &mut raw, channel as u32) {
            if device.is_stopped() {
                break;
            }
            warn!(device = device.id(), channel, error = %e, "response wait failed");
            continue;
        }
        if device.is_stopped() {
            break;
        }
        let response: DeviceResponse = bytemuck::pod_read_unaligned(&raw);
        if response.proc_id == 0 {
            continue;
        }
        if response.proc_id != device.proc_id() {
            trace!(
                device = device.id(),
                req_id = response.req_id,
                proc = response.proc_id,
                "response from another process"
            );
            continue;
        }
        if response.status != 0 {
            device.dump_diagnostics();
            device.events().dispatch(RuntimeEvent {
                level: EventLevel::Critical,
                kind: EventKind::DeviceIo,
                code: EventCode::ReadOutput,
                message: format!(
                    "request {}: firmware error {:#x}",
                    response.req_id, response.status
                ),
                device_id: Some(device.id()),
            });
            device.finish_request(response.req_id);
            sink.fail(
                &device,
                response.req_id as usize,
                format!("firmware error {:#x}", response.status),
            );
            continue;
        }
        sink.process(&device, response);
    }
    debug!(device = device.id(), channel, "output handler exit");
}
