//! Neutron runtime
//!
//! A user-space runtime that executes compiled neural-network models on an
//! attached NPU accelerator family, with optional CPU fallback tasks. The
//! engine ingests a compiled model package, constructs a pipeline of NPU
//! and CPU tasks, and drives inference requests through it with bounded
//! concurrency, explicit buffer ownership and per-request latency
//! accounting.
//!
//! ```no_run
//! use neutron_runtime::{EngineOptions, InferenceEngine};
//!
//! # fn main() -> neutron_runtime::Result<()> {
//! let engine = InferenceEngine::open("model.nxpkg", EngineOptions::default())?;
//! let input = vec![0u8; engine.input_size() as usize];
//! let outputs = engine.run(&input)?;
//! for tensor in &outputs {
//!     println!("{tensor}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod cpu;
pub mod device;
mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod model;
pub mod pools;
pub mod profiler;
pub mod request;
pub mod task;
pub mod tensor;

pub use config::{EngineOptions, RuntimeConfig};
pub use engine::{EngineCallback, InferenceEngine, JobId};
pub use error::{Error, Result};
pub use job::UserArg;
pub use model::ModelPackage;
pub use tensor::{DataType, Tensor, TensorList};
