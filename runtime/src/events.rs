//! Runtime event dispatch
//!
//! Fan-out of `(level, type, code, message)` notifications to registered
//! handlers. Workers report I/O failures, device errors, recoveries and
//! clamped outputs here; handlers must not block.

use parking_lot::RwLock;
use tracing::{error, warn};

/// Severity of a runtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Subsystem an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DeviceIo,
    Scheduler,
    Runtime,
}

/// Specific condition within the subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    WriteInput,
    ReadOutput,
    DeviceEvent,
    Recovery,
    Throttle,
    PpuFilterClamped,
}

/// One runtime notification
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub level: EventLevel,
    pub kind: EventKind,
    pub code: EventCode,
    pub message: String,
    pub device_id: Option<usize>,
}

type Handler = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Fan-out dispatcher
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Handler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler; handlers persist for the dispatcher's lifetime.
    pub fn register(&self, handler: impl Fn(&RuntimeEvent) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    /// Deliver an event to every registered handler.
    pub fn dispatch(&self, event: RuntimeEvent) {
        match event.level {
            EventLevel::Error | EventLevel::Critical => {
                error!(?event.kind, ?event.code, device = ?event.device_id, "{}", event.message)
            }
            EventLevel::Warning => {
                warn!(?event.kind, ?event.code, device = ?event.device_id, "{}", event.message)
            }
            EventLevel::Info => {}
        }
        for handler in self.handlers.read().iter() {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fan_out() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            dispatcher.register(move |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            });
        }
        dispatcher.dispatch(RuntimeEvent {
            level: EventLevel::Warning,
            kind: EventKind::DeviceIo,
            code: EventCode::WriteInput,
            message: "write failed".into(),
            device_id: Some(0),
        });
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
