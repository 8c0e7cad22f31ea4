//! Input handler
//!
//! Drains the device's request FIFO: assigns a DMA channel round-robin,
//! writes the encoded input payload to device memory and issues the run
//! command. A busy submit is retried with the input-data field cleared;
//! the queue has accepted the data but cannot yet accept the descriptor.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, trace};

use super::{Device, ResponseSink};
use crate::driver::{DeviceCommand, IoStatus};
use crate::events::{EventCode, EventKind, EventLevel, RuntimeEvent};

pub(super) fn run(device: Arc<Device>, rx: Receiver<usize>, sink: Arc<dyn ResponseSink>) {
    let dma_channels = device.info().num_dma_ch.max(1);
    let skip_io = device.config().skip_inference_io;
    let mut submitted: u64 = 0;
    debug!(device = device.id(), "input handler entry");

    // The FIFO closes on terminate; iter() then drains and ends.
    for request_id in rx.iter() {
        if device.is_stopped() {
            break;
        }
        let Some(mut acc) = device.inflight_get(request_id as u32) else {
            trace!(request_id, "no in-flight record; dropping");
            continue;
        };
        acc.dma_ch = (submitted % dma_channels as u64) as u32;
        submitted += 1;

        if !skip_io && acc.input.data != 0 {
            if let Err(e) = device.write_mem(acc.input) {
                device.events().dispatch(RuntimeEvent {
                    level: EventLevel::Critical,
                    kind: EventKind::DeviceIo,
                    code: EventCode::WriteInput,
                    message: format!("request {request_id}: input write failed: {e}"),
                    device_id: Some(device.id()),
                });
                device.finish_request(request_id as u32);
                sink.fail(&device, request_id, format!("input write failed: {e}"));
                continue;
            }
        }

        let mut raw = bytemuck::bytes_of(&acc).to_vec();
        loop {
            match device.process(DeviceCommand::NpuRunReq, &mut raw, 0) {
                Ok(IoStatus::Done) => break,
                Ok(IoStatus::Busy) => {
                    // payload is already on the device; clear the data field
                    // so the retry does not rewrite it
                    acc.input.data = 0;
                    raw = bytemuck::bytes_of(&acc).to_vec();
                    if device.is_stopped() {
                        break;
                    }
                }
                Err(e) => {
                    device.events().dispatch(RuntimeEvent {
                        level: EventLevel::Critical,
                        kind: EventKind::DeviceIo,
                        code: EventCode::WriteInput,
                        message: format!("request {request_id}: submit failed: {e}"),
                        device_id: Some(device.id()),
                    });
                    device.finish_request(request_id as u32);
                    sink.fail(&device, request_id, format!("submit failed: {e}"));
                    break;
                }
            }
        }
    }
    debug!(device = device.id(), submitted, "input handler exit");
}
