//! Event handler
//!
//! A dedicated thread long-polls the driver's event command. Errors block
//! the device and dump diagnostics; throttle notices are surfaced as
//! warnings; recovery events rewrite the affected parameter regions and
//! restart the firmware.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Device;
use crate::driver::{
    DeviceCommand, DeviceEvent, EVENT_ERROR, EVENT_RECOVERY, EVENT_TERMINATE, EVENT_THROTTLE,
    RECOVERY_DONE, RECOVERY_RMAP, RECOVERY_WEIGHT,
};
use crate::events::{EventCode, EventKind, EventLevel, RuntimeEvent};

const RMAP_RECOVERY_DONE: u32 = 1;
const WEIGHT_RECOVERY_DONE: u32 = 2;

pub(super) fn run(device: Arc<Device>) {
    debug!(device = device.id(), "event handler entry");
    loop {
        if device.is_stopped() {
            break;
        }
        let mut raw = [0u8; std::mem::size_of::<DeviceEvent>()];
        if let Err(e) = device.process(DeviceCommand::Event, &mut raw, 0) {
            if device.is_stopped() {
                break;
            }
            warn!(device = device.id(), error = %e, "event wait failed");
            continue;
        }
        let event: DeviceEvent = bytemuck::pod_read_unaligned(&raw);
        match event.event_type {
            EVENT_TERMINATE => {
                if device.is_stopped() {
                    break;
                }
            }
            EVENT_ERROR => {
                device.block();
                device.dump_diagnostics();
                device.events().dispatch(RuntimeEvent {
                    level: EventLevel::Error,
                    kind: EventKind::DeviceIo,
                    code: EventCode::DeviceEvent,
                    message: format!("firmware error event {:#x}", event.err_code),
                    device_id: Some(device.id()),
                });
                break;
            }
            EVENT_THROTTLE => {
                device.events().dispatch(RuntimeEvent {
                    level: EventLevel::Warning,
                    kind: EventKind::DeviceIo,
                    code: EventCode::Throttle,
                    message: format!("thermal throttle notice, level {}", event.value),
                    device_id: Some(device.id()),
                });
            }
            EVENT_RECOVERY => match event.recovery_action {
                RECOVERY_RMAP => {
                    let outcome = device.rewrite_params(true, false);
                    device.events().dispatch(RuntimeEvent {
                        level: EventLevel::Warning,
                        kind: EventKind::DeviceIo,
                        code: EventCode::Recovery,
                        message: "register map recovered and rewritten".into(),
                        device_id: Some(device.id()),
                    });
                    if outcome.is_ok() {
                        let _ = device.start_firmware(RMAP_RECOVERY_DONE);
                    }
                }
                RECOVERY_WEIGHT => {
                    let outcome = device.rewrite_params(false, true);
                    device.events().dispatch(RuntimeEvent {
                        level: EventLevel::Warning,
                        kind: EventKind::DeviceIo,
                        code: EventCode::Recovery,
                        message: "weights recovered and rewritten".into(),
                        device_id: Some(device.id()),
                    });
                    if outcome.is_ok() {
                        let _ = device.start_firmware(WEIGHT_RECOVERY_DONE);
                    }
                }
                RECOVERY_DONE => {
                    info!(device = device.id(), "device recovery complete");
                }
                other => {
                    warn!(device = device.id(), action = other, "unknown recovery action");
                }
            },
            other => {
                debug!(device = device.id(), event = other, "unknown device event");
            }
        }
    }
    debug!(device = device.id(), "event handler exit");
}
