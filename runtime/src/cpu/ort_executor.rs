//! ONNX Runtime executor
//!
//! Wraps an in-memory ONNX session behind the [`CpuExecutor`] trait. Only
//! the byte-level `run` contract is exposed; session details never leak
//! into the engine.

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;

use super::{CpuExecutor, CpuIo, CpuIoMut};
use crate::error::{Error, Result};
use crate::tensor::DataType;

pub struct OrtExecutor {
    session: Mutex<Session>,
}

impl OrtExecutor {
    pub fn from_bytes(model: &[u8]) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level2))
            .and_then(|b| b.commit_from_memory(model))
            .map_err(|e| Error::InvalidModel(format!("onnx session: {e}")))?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

fn to_value(io: &CpuIo<'_>) -> Result<Value> {
    let shape: Vec<i64> = io.shape.iter().map(|&d| d.max(1)).collect();
    match io.dtype {
        DataType::Float32 => {
            let data: Vec<f32> = io
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Value::from_array((shape, data))
                .map(Value::from)
                .map_err(|e| Error::InvalidArgument(format!("onnx input: {e}")))
        }
        DataType::Uint8 => Value::from_array((shape, io.data.to_vec()))
            .map(Value::from)
            .map_err(|e| Error::InvalidArgument(format!("onnx input: {e}"))),
        other => Err(Error::InvalidArgument(format!(
            "unsupported onnx input dtype {other}"
        ))),
    }
}

impl CpuExecutor for OrtExecutor {
    fn run(&self, inputs: &[CpuIo<'_>], outputs: &mut [CpuIoMut<'_>]) -> Result<()> {
        let mut session = self.session.lock();
        let feed: Vec<(String, Value)> = inputs
            .iter()
            .map(|io| Ok((io.name.to_string(), to_value(io)?)))
            .collect::<Result<_>>()?;
        let results = session
            .run(feed)
            .map_err(|e| Error::InvalidOperation(format!("onnx run: {e}")))?;
        for out in outputs.iter_mut() {
            let value = results.get(out.name).ok_or_else(|| {
                Error::InvalidOperation(format!("onnx output '{}' missing", out.name))
            })?;
            // element type must match the declared tensor dtype, same as the
            // input conversion above
            match out.dtype {
                DataType::Float32 => {
                    let (_, elems) = value
                        .try_extract_raw_tensor::<f32>()
                        .map_err(|e| Error::InvalidOperation(format!("onnx output: {e}")))?;
                    for (chunk, v) in out.data.chunks_exact_mut(4).zip(elems.iter()) {
                        chunk.copy_from_slice(&v.to_le_bytes());
                    }
                }
                DataType::Uint8 => {
                    let (_, bytes) = value
                        .try_extract_raw_tensor::<u8>()
                        .map_err(|e| Error::InvalidOperation(format!("onnx output: {e}")))?;
                    let n = bytes.len().min(out.data.len());
                    out.data[..n].copy_from_slice(&bytes[..n]);
                }
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "unsupported onnx output dtype {other} for '{}'",
                        out.name
                    )));
                }
            }
        }
        Ok(())
    }
}
