//! CPU fallback execution
//!
//! A CPU task owns a framework-agnostic model session behind the
//! [`CpuExecutor`] capability trait; the engine never peeks inside. The
//! ONNX-Runtime-backed executor lives behind the `onnx` feature.

pub mod worker;

#[cfg(feature = "onnx")]
pub mod ort_executor;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tensor::DataType;

pub use worker::CpuWorker;

/// Borrowed view of one input tensor handed to an executor
pub struct CpuIo<'a> {
    pub name: &'a str,
    pub shape: &'a [i64],
    pub dtype: DataType,
    pub data: &'a [u8],
}

/// Borrowed view of one output tensor an executor fills in
pub struct CpuIoMut<'a> {
    pub name: &'a str,
    pub shape: &'a [i64],
    pub dtype: DataType,
    pub data: &'a mut [u8],
}

/// A CPU-side model session. `run` is the only contract.
pub trait CpuExecutor: Send + Sync {
    fn run(&self, inputs: &[CpuIo<'_>], outputs: &mut [CpuIoMut<'_>]) -> Result<()>;
}

/// Builds an executor from a subgraph's opaque model blob
pub type CpuExecutorFactory =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn CpuExecutor>> + Send + Sync>;

/// Default factory: the ONNX-backed executor when the `onnx` feature is on.
pub fn default_executor_factory() -> Option<CpuExecutorFactory> {
    #[cfg(feature = "onnx")]
    {
        Some(Arc::new(|blob: &[u8]| {
            Ok(Box::new(ort_executor::OrtExecutor::from_bytes(blob)?) as Box<dyn CpuExecutor>)
        }))
    }
    #[cfg(not(feature = "onnx"))]
    {
        None
    }
}

/// One CPU task's session plus its worker pool
pub struct CpuTaskHandle {
    name: String,
    executor: Arc<dyn CpuExecutor>,
    model_size: usize,
    worker: Mutex<Option<Arc<CpuWorker>>>,
}

impl CpuTaskHandle {
    pub fn new(name: impl Into<String>, executor: Box<dyn CpuExecutor>, model_size: usize) -> Self {
        Self {
            name: name.into(),
            executor: Arc::from(executor),
            model_size,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> Arc<dyn CpuExecutor> {
        Arc::clone(&self.executor)
    }

    /// Extra threads a dynamically scaled worker starts with, chosen by
    /// model size.
    pub fn initial_dynamic_threads(&self) -> usize {
        if self.model_size <= 64 * 1024 {
            0
        } else if self.model_size <= 1024 * 1024 {
            1
        } else {
            3
        }
    }

    pub fn attach_worker(&self, worker: Arc<CpuWorker>) {
        *self.worker.lock() = Some(worker);
    }

    pub fn worker(&self) -> Result<Arc<CpuWorker>> {
        self.worker
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("CPU task '{}' not started", self.name)))
    }

    pub fn terminate(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl CpuExecutor for Doubler {
        fn run(&self, inputs: &[CpuIo<'_>], outputs: &mut [CpuIoMut<'_>]) -> Result<()> {
            for (i, o) in inputs.iter().zip(outputs.iter_mut()) {
                for (s, d) in i.data.iter().zip(o.data.iter_mut()) {
                    *d = s.wrapping_mul(2);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_executor_contract() {
        let exec = Doubler;
        let input = [1u8, 2, 3];
        let mut output = [0u8; 3];
        let inputs = [CpuIo {
            name: "in",
            shape: &[3],
            dtype: DataType::Uint8,
            data: &input,
        }];
        let mut outputs = [CpuIoMut {
            name: "out",
            shape: &[3],
            dtype: DataType::Uint8,
            data: &mut output,
        }];
        exec.run(&inputs, &mut outputs).unwrap();
        assert_eq!(output, [2, 4, 6]);
    }

    #[test]
    fn test_initial_dynamic_threads_by_model_size() {
        let small = CpuTaskHandle::new("s", Box::new(Doubler), 32 * 1024);
        let medium = CpuTaskHandle::new("m", Box::new(Doubler), 512 * 1024);
        let large = CpuTaskHandle::new("l", Box::new(Doubler), 4 * 1024 * 1024);
        assert_eq!(small.initial_dynamic_threads(), 0);
        assert_eq!(medium.initial_dynamic_threads(), 1);
        assert_eq!(large.initial_dynamic_threads(), 3);
    }
}
