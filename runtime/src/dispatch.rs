//! Request dispatch and response processing
//!
//! Routes a request to the CPU worker or, after picking a device, to that
//! accelerator's input pipeline; and turns completion records back into
//! decoded tensors, buffer recycling and job fan-out.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::codec::{self, Layout, TransposeKind};
use crate::device::{Device, ResponseSink};
use crate::driver::{DeviceResponse, MemInfo};
use crate::engine::EngineCore;
use crate::error::{Error, Result};
use crate::events::{EventCode, EventKind, EventLevel, RuntimeEvent};
use crate::model::{NpuModelKind, Processor, TensorInfo};
use crate::request::{Request, RequestStatus};
use crate::task::Task;

/// Fixed copy size of a PPU bulk output region
const PPU_OUTPUT_REGION: usize = 128 * 1024;

impl EngineCore {
    /// Route one request to its processor. NPU requests claim a device and
    /// a buffer-set and are staged through the input pipeline; CPU requests
    /// go to the task's worker FIFO.
    pub(crate) fn submit(self: &Arc<Self>, req: &Arc<Request>) -> Result<()> {
        let task = req.task();
        if self.profiler().enabled() {
            self.profiler().start(&format!("task[{}]", task.name()));
        }
        let pin = req
            .job_id()
            .and_then(|id| self.job_pool().get(id))
            .and_then(|job| job.device_pin());
        match task.processor() {
            Processor::Npu => {
                let candidates: Vec<usize> = match pin {
                    Some(id) => vec![id],
                    None => task.device_ids().to_vec(),
                };
                let device = self.device_pool().wait_one(&candidates)?;
                trace!(request = req.id(), device = device.id(), "device picked");
                let buffers = match task.acquire_all_buffers() {
                    Ok(buffers) => buffers,
                    Err(e) => {
                        // free the claimed capacity so other jobs can make
                        // progress
                        device.callback();
                        return Err(e);
                    }
                };
                req.set_encoded_buffers(buffers.encoded_input, buffers.encoded_output);
                if !req.outputs_is_user_buffer() {
                    req.set_output_buffer_base(buffers.output, false);
                    req.set_outputs(task.outputs(buffers.output));
                }
                req.set_buffer_set(buffers);
                if let Err(e) = encode_task_inputs(req, &task) {
                    device.callback();
                    return Err(e);
                }
                device.inference_request(req).map_err(|e| {
                    device.callback();
                    e
                })
            }
            Processor::Cpu => {
                let buffers = task.acquire_all_buffers()?;
                if !req.outputs_is_user_buffer() {
                    req.set_output_buffer_base(buffers.output, false);
                    req.set_outputs(task.outputs(buffers.output));
                }
                req.set_buffer_set(buffers);
                let handle = task.cpu_handle().ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "CPU task '{}' has no executor session",
                        task.name()
                    ))
                })?;
                handle.worker()?.request(Arc::clone(req))
            }
        }
    }

    /// Finish a request that produced usable outputs.
    pub(crate) fn complete_request(&self, req: &Arc<Request>, response: Option<&DeviceResponse>) {
        req.finish_timing(response);
        req.set_status(RequestStatus::Done);
        if self.profiler().enabled() {
            self.profiler().end(&format!("task[{}]", req.task().name()));
        }
        if self.config().debug_data > 0 {
            for out in req.outputs() {
                debug!(
                    request = req.id(),
                    tensor = %out.name(),
                    bytes = out.size_in_bytes(),
                    by = %req.processed_by(),
                    "output ready"
                );
            }
        }
        let Some(job_id) = req.job_id() else {
            req.reset();
            return;
        };
        match self.job_pool().get(job_id) {
            Some(job) => job.on_request_complete(req),
            None => req.reset(),
        }
    }

    /// Finish a request that failed before producing outputs.
    pub(crate) fn fail_request(&self, req: &Arc<Request>, message: &str) {
        req.finish_timing(None);
        req.mark_failed();
        req.set_status(RequestStatus::Done);
        let Some(job_id) = req.job_id() else {
            req.reset();
            return;
        };
        match self.job_pool().get(job_id) {
            Some(job) => job.on_request_failed(req, message),
            None => req.reset(),
        }
    }
}

impl ResponseSink for EngineCore {
    fn process(&self, device: &Arc<Device>, response: DeviceResponse) {
        let Some(req) = self.request_pool().get(response.req_id as usize) else {
            warn!(req_id = response.req_id, "response for unknown request");
            return;
        };
        if req.status() != RequestStatus::Busy || req.job_id().is_none() {
            debug!(req_id = response.req_id, "response for idle request; dropping");
            device.finish_request(response.req_id);
            return;
        }
        let Some(acc) = device.inflight_get(response.req_id) else {
            debug!(req_id = response.req_id, "response without in-flight record");
            return;
        };
        let task = req.task();
        let kind = task.npu_kind().unwrap_or(NpuModelKind::Normal);
        let skip_io = device.config().skip_inference_io;

        // move the device-side output into the host staging buffer
        let read_result = match kind {
            NpuModelKind::Argmax => Ok(()),
            NpuModelKind::Ppcpu => {
                let max = task
                    .info()
                    .npu
                    .as_ref()
                    .map(|n| n.ppu_filter_max)
                    .unwrap_or(u32::MAX);
                let filters = clamp_filter_num(self, device, &task, response.ppu_filter_num, max);
                let unit = task
                    .info()
                    .outputs
                    .first()
                    .map(|t| t.dtype.elem_size())
                    .unwrap_or(1);
                let size = (filters as u64) * unit as u64;
                if skip_io || size == 0 || req.encoded_outputs().is_null() {
                    Ok(())
                } else {
                    device.read_mem(MemInfo {
                        data: req.encoded_outputs().0 as u64,
                        base: acc.output.base,
                        offset: acc.output.offset,
                        size,
                    })
                }
            }
            NpuModelKind::Normal | NpuModelKind::Ppu => {
                if skip_io || req.encoded_outputs().is_null() {
                    Ok(())
                } else {
                    device.read_mem(MemInfo {
                        data: req.encoded_outputs().0 as u64,
                        base: acc.output.base,
                        offset: acc.output.offset,
                        size: acc.output.size,
                    })
                }
            }
        };
        device.finish_request(response.req_id);
        req.set_processed_by(&format!("NPU_{}_ch{}", device.id(), response.dma_ch));

        if let Err(e) = read_result {
            device.events().dispatch(RuntimeEvent {
                level: EventLevel::Critical,
                kind: EventKind::DeviceIo,
                code: EventCode::ReadOutput,
                message: format!("request {}: output read failed: {e}", response.req_id),
                device_id: Some(device.id()),
            });
            self.fail_request(&req, &format!("output read failed: {e}"));
            return;
        }

        match kind {
            NpuModelKind::Normal => decode_normal_outputs(&req, &task),
            NpuModelKind::Argmax => {
                let outputs = req.outputs();
                if let Some(out) = outputs.first() {
                    if !out.data().is_null() {
                        let dst = unsafe { out.as_mut_slice() };
                        if dst.len() >= 2 {
                            dst[..2].copy_from_slice(&response.argmax.to_le_bytes());
                        }
                    }
                }
            }
            NpuModelKind::Ppu => {
                let max = task
                    .info()
                    .npu
                    .as_ref()
                    .map(|n| n.ppu_filter_max)
                    .unwrap_or(u32::MAX);
                let outputs = req.outputs();
                if let Some(out) = outputs.first() {
                    let capacity = out.size_in_bytes();
                    if !out.data().is_null() && !req.encoded_outputs().is_null() {
                        let n = capacity
                            .min(PPU_OUTPUT_REGION)
                            .min(task.encoded_output_size() as usize);
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                req.encoded_outputs().0,
                                out.data().0,
                                n,
                            );
                        }
                    }
                    // the shape must never claim more elements than were
                    // declared or copied
                    let mut filters =
                        clamp_filter_num(self, device, &task, response.ppu_filter_num, max);
                    let capacity_elems = (capacity / out.dtype().elem_size().max(1)) as u32;
                    filters = filters.min(capacity_elems);
                    req.set_output_shape(0, vec![1, filters as i64]);
                }
            }
            NpuModelKind::Ppcpu => {
                let max = task
                    .info()
                    .npu
                    .as_ref()
                    .map(|n| n.ppu_filter_max)
                    .unwrap_or(u32::MAX);
                let filters = response.ppu_filter_num.min(max);
                let outputs = req.outputs();
                if let Some(out) = outputs.first() {
                    if filters > 0 && !out.data().is_null() && !req.encoded_outputs().is_null() {
                        let unit = out.dtype().elem_size();
                        let n = (filters as usize * unit).min(out.size_in_bytes());
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                req.encoded_outputs().0,
                                out.data().0,
                                n,
                            );
                        }
                        req.set_output_shape(0, vec![1, filters as i64]);
                    } else {
                        req.set_output_shape(0, vec![0, 0]);
                    }
                }
            }
        }
        self.complete_request(&req, Some(&response));
    }

    fn fail(&self, _device: &Arc<Device>, request_id: usize, message: String) {
        let Some(req) = self.request_pool().get(request_id) else {
            return;
        };
        if req.status() != RequestStatus::Busy {
            return;
        }
        self.fail_request(&req, &message);
    }
}

fn clamp_filter_num(
    core: &EngineCore,
    device: &Arc<Device>,
    task: &Arc<Task>,
    reported: u32,
    max: u32,
) -> u32 {
    if reported > max {
        core.events().dispatch(RuntimeEvent {
            level: EventLevel::Warning,
            kind: EventKind::DeviceIo,
            code: EventCode::PpuFilterClamped,
            message: format!(
                "task '{}': filter count {reported} exceeds declared maximum {max}; clamped",
                task.name()
            ),
            device_id: Some(device.id()),
        });
        max
    } else {
        reported
    }
}

/// Stage every input tensor of an NPU request into the encoded-input buffer
/// according to the tensor's declared layout.
pub(crate) fn encode_task_inputs(req: &Arc<Request>, task: &Arc<Task>) -> Result<()> {
    let enc_base = req.encoded_inputs();
    if enc_base.is_null() {
        return Ok(());
    }
    let pool_size = task.encoded_input_size() as usize;
    let inputs = req.inputs();
    for (tensor, info) in inputs.iter().zip(task.info().inputs.iter()) {
        if tensor.data().is_null() {
            return Err(Error::InvalidArgument(format!(
                "input tensor '{}' has no data",
                info.name
            )));
        }
        let offset = info.encoded_offset as usize;
        if offset >= pool_size {
            continue;
        }
        let capacity = pool_size - offset;
        let enc_size = if info.encoded_size == 0 {
            tensor.size_in_bytes()
        } else {
            info.encoded_size as usize
        }
        .min(capacity);
        let src = unsafe { tensor.as_slice() };
        let dst =
            unsafe { std::slice::from_raw_parts_mut(enc_base.add(offset).0, enc_size) };
        encode_one(info, src, dst);
    }
    Ok(())
}

fn encode_one(info: &TensorInfo, src: &[u8], dst: &mut [u8]) {
    match info.layout {
        Layout::PreFormatter => codec::encode_preformatter(src, dst),
        Layout::PreIm2col => {
            let dims = &info.shape;
            let channel = dims.last().copied().unwrap_or(1).max(1) as usize;
            let width = dims
                .len()
                .checked_sub(2)
                .and_then(|i| dims.get(i))
                .copied()
                .unwrap_or(1)
                .max(1) as usize;
            codec::encode_preim2col(src, dst, width, channel);
        }
        Layout::Formatted => {
            if info.transpose == TransposeKind::ChannelFirstToLast && info.shape.len() >= 2 {
                // channel-first user tensor: rows are the channel dim
                let row = info.shape[1].max(1) as usize;
                let col: usize = info.shape[2..]
                    .iter()
                    .map(|&d| d.max(1) as usize)
                    .product::<usize>()
                    .max(1);
                let elem = info.dtype.elem_size();
                codec::encode_formatted_transposed(
                    src,
                    dst,
                    row,
                    col,
                    elem,
                    info.align_unit.max(1) as usize,
                );
            } else {
                let channel = info.shape.last().copied().unwrap_or(1).max(1) as usize;
                codec::encode_formatted(src, dst, channel);
            }
        }
        other => {
            if !matches!(other, Layout::Identity) {
                trace!(layout = ?other, tensor = %info.name, "layout copied verbatim");
            }
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// Decode every output of a NORMAL response from the encoded staging buffer
/// into the request's user-layout output tensors.
pub(crate) fn decode_normal_outputs(req: &Arc<Request>, task: &Arc<Task>) {
    let enc_base = req.encoded_outputs();
    if enc_base.is_null() {
        return;
    }
    let pool_size = task.encoded_output_size() as usize;
    let outputs = req.outputs();
    for (tensor, info) in outputs.iter().zip(task.info().outputs.iter()) {
        if tensor.data().is_null() {
            continue;
        }
        let offset = info.encoded_offset as usize;
        if offset >= pool_size {
            continue;
        }
        let capacity = pool_size - offset;
        let enc_size = if info.encoded_size == 0 {
            tensor.size_in_bytes()
        } else {
            info.encoded_size as usize
        }
        .min(capacity);
        let src = unsafe { std::slice::from_raw_parts(enc_base.add(offset).0, enc_size) };
        let dst = unsafe { tensor.as_mut_slice() };
        decode_one(info, src, dst);
    }
}

fn decode_one(info: &TensorInfo, src: &[u8], dst: &mut [u8]) {
    if info.layout == Layout::Aligned {
        let channel = info
            .shape_encoded
            .last()
            .copied()
            .unwrap_or(1)
            .max(1) as usize;
        match info.transpose {
            TransposeKind::None => {
                codec::decode_aligned(src, dst, channel, info.dtype_encoded);
            }
            TransposeKind::ChannelLastToFirst => {
                codec::decode_aligned_transposed(
                    src,
                    dst,
                    channel,
                    info.dtype_encoded,
                    &info.shape_encoded,
                    TransposeKind::ChannelLastToFirst,
                );
            }
            other => {
                warn!(transpose = ?other, tensor = %info.name, "unexpected transpose; copying");
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
        }
    } else {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
    }
}
