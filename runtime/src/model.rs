//! Compiled model package
//!
//! In-memory form of the compiled model container: per-subgraph register
//! maps, weight blobs, optional post-processing binaries, and the task
//! graph. The on-disk grammar is owned by the compiler toolchain; the
//! runtime consumes the self-describing serialized form and validates the
//! version gates here.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{Layout, TransposeKind};
use crate::error::{Error, Result};
use crate::tensor::{DataType, MemoryKind, Tensor};

/// Oldest package file-format version the runtime accepts
pub const MIN_FILE_FORMAT_VERSION: u32 = 6;
/// Newest package file-format version the runtime accepts
pub const MAX_FILE_FORMAT_VERSION: u32 = 8;
/// Oldest compiler the runtime accepts packages from
pub const MIN_COMPILER_VERSION: u32 = 6;

/// Which processor executes a subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    Npu,
    Cpu,
}

/// Firmware-level model flavor of an NPU subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NpuModelKind {
    /// Bulk output region decoded through the format codec
    Normal,
    /// Response record carries a 16-bit argmax value
    Argmax,
    /// Response record carries a filter count; fixed-size region copy
    Ppu,
    /// Post-processing binary runs CPU-side; filtered output read by count
    Ppcpu,
}

/// Per-tensor layout metadata from the register-map info section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<i64>,
    pub dtype_encoded: DataType,
    pub shape_encoded: Vec<i64>,
    pub layout: Layout,
    pub align_unit: u32,
    pub transpose: TransposeKind,
    pub scale: f32,
    pub bias: f32,
    /// Byte offset of this tensor within the subgraph's encoded region
    pub encoded_offset: u64,
    /// Encoded (padded) byte size
    pub encoded_size: u64,
    pub memory_kind: MemoryKind,
}

impl TensorInfo {
    /// Size of the tensor in the caller-facing layout
    pub fn user_size(&self) -> u64 {
        let mut elems: u64 = 1;
        for &d in &self.shape {
            if d > 0 {
                elems = elems.saturating_mul(d as u64);
            }
        }
        elems * self.dtype.elem_size() as u64
    }

    /// Descriptor for this tensor, unbound
    pub fn to_tensor(&self) -> Tensor {
        let mut t = Tensor::new(self.name.clone(), self.shape.clone(), self.dtype);
        t.set_memory_kind(self.memory_kind);
        t
    }
}

/// NPU-specific payload of a subgraph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpuSubGraph {
    pub kind: NpuModelKind,
    /// Register/command image read by firmware at dispatch
    pub rmap: Vec<u8>,
    /// Weight blob
    pub weight: Vec<u8>,
    /// Post-processing binary (PPCPU subgraphs)
    pub ppu_binary: Option<Vec<u8>>,
    /// Total encoded input size in bytes
    pub encoded_input_size: u64,
    /// Total encoded output size in bytes
    pub encoded_output_size: u64,
    /// Device memory needed for this subgraph's outputs
    pub output_mem_size: u64,
    /// Offset of the output region relative to the inference slot
    /// (0 means "right after the aligned input")
    pub output_all_offset: u64,
    /// Offset of the externally visible output within the output region
    pub last_output_offset: u64,
    /// Maximum filter count a PPU/PPCPU response may report
    pub ppu_filter_max: u32,
}

/// CPU-fallback payload of a subgraph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSubGraph {
    /// Opaque model blob handed to the `CpuExecutor` factory
    pub model: Vec<u8>,
}

/// One node of the task graph as named by the model container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGraphInfo {
    pub name: String,
    pub processor: Processor,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub npu: Option<NpuSubGraph>,
    pub cpu: Option<CpuSubGraph>,
}

impl SubGraphInfo {
    pub fn input_size(&self) -> u64 {
        self.inputs.iter().map(TensorInfo::user_size).sum()
    }

    pub fn output_size(&self) -> u64 {
        self.outputs.iter().map(TensorInfo::user_size).sum()
    }
}

/// A compiled model package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPackage {
    pub model_name: String,
    pub file_format_version: u32,
    pub compiler_version: u32,
    /// Compile flavor recorded by the compiler (e.g. "npu", "mixed")
    pub compile_type: String,
    /// Model-external input tensor names
    pub inputs: Vec<String>,
    /// Declared model output tensor names, in canonical order
    pub outputs: Vec<String>,
    /// Topological order of subgraph names
    pub topo_order: Vec<String>,
    pub subgraphs: Vec<SubGraphInfo>,
}

impl ModelPackage {
    /// Load a package from disk and run the version and consistency gates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        let package: ModelPackage = bincode::deserialize(&bytes)?;
        package.validate()?;
        info!(
            model = %package.model_name,
            format_version = package.file_format_version,
            compiler_version = package.compiler_version,
            inputs = ?package.inputs,
            outputs = ?package.outputs,
            tasks = ?package.topo_order,
            "model package loaded"
        );
        Ok(package)
    }

    /// Serialize the package to disk (compiler/tooling surface).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn subgraph(&self, name: &str) -> Option<&SubGraphInfo> {
        self.subgraphs.iter().find(|s| s.name == name)
    }

    /// Version gates and graph consistency checks.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FILE_FORMAT_VERSION..=MAX_FILE_FORMAT_VERSION).contains(&self.file_format_version)
        {
            return Err(Error::InvalidModel(format!(
                "unsupported file format version {} (supported: {}..={})",
                self.file_format_version, MIN_FILE_FORMAT_VERSION, MAX_FILE_FORMAT_VERSION
            )));
        }
        if self.compiler_version < MIN_COMPILER_VERSION {
            return Err(Error::InvalidModel(format!(
                "compiler version {} below minimum supported {}",
                self.compiler_version, MIN_COMPILER_VERSION
            )));
        }
        if self.subgraphs.is_empty() {
            return Err(Error::InvalidModel("package has no subgraphs".into()));
        }
        for name in &self.topo_order {
            if self.subgraph(name).is_none() {
                return Err(Error::InvalidModel(format!(
                    "topological order names unknown subgraph '{name}'"
                )));
            }
        }
        for sg in &self.subgraphs {
            match sg.processor {
                Processor::Npu if sg.npu.is_none() => {
                    return Err(Error::InvalidModel(format!(
                        "NPU subgraph '{}' is missing its register map section",
                        sg.name
                    )));
                }
                Processor::Cpu if sg.cpu.is_none() => {
                    return Err(Error::InvalidModel(format!(
                        "CPU subgraph '{}' is missing its model blob",
                        sg.name
                    )));
                }
                _ => {}
            }
        }
        // Producer names must be unique across the graph; a collision makes
        // consumer binding ambiguous.
        let mut seen = std::collections::HashSet::new();
        for sg in &self.subgraphs {
            for out in &sg.outputs {
                if !seen.insert(out.name.as_str()) {
                    return Err(Error::InvalidModel(format!(
                        "output tensor '{}' is produced by more than one subgraph",
                        out.name
                    )));
                }
            }
        }
        for out in &self.outputs {
            if !seen.contains(out.as_str()) {
                return Err(Error::InvalidModel(format!(
                    "declared model output '{out}' is not produced by any subgraph"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Layout;

    fn tensor_info(name: &str, shape: Vec<i64>, dtype: DataType) -> TensorInfo {
        TensorInfo {
            name: name.into(),
            dtype,
            shape: shape.clone(),
            dtype_encoded: dtype,
            shape_encoded: shape,
            layout: Layout::Identity,
            align_unit: 64,
            transpose: TransposeKind::None,
            scale: 1.0,
            bias: 0.0,
            encoded_offset: 0,
            encoded_size: 0,
            memory_kind: MemoryKind::Dram,
        }
    }

    fn minimal_package() -> ModelPackage {
        ModelPackage {
            model_name: "m".into(),
            file_format_version: 7,
            compiler_version: 7,
            compile_type: "cpu".into(),
            inputs: vec!["in".into()],
            outputs: vec!["out".into()],
            topo_order: vec!["sg0".into()],
            subgraphs: vec![SubGraphInfo {
                name: "sg0".into(),
                processor: Processor::Cpu,
                inputs: vec![tensor_info("in", vec![1, 4], DataType::Float32)],
                outputs: vec![tensor_info("out", vec![1, 4], DataType::Float32)],
                npu: None,
                cpu: Some(CpuSubGraph { model: vec![] }),
            }],
        }
    }

    #[test]
    fn test_validate_ok() {
        minimal_package().validate().unwrap();
    }

    #[test]
    fn test_version_gates() {
        let mut p = minimal_package();
        p.file_format_version = 5;
        assert!(matches!(p.validate(), Err(Error::InvalidModel(_))));
        p.file_format_version = 9;
        assert!(matches!(p.validate(), Err(Error::InvalidModel(_))));
        let mut p = minimal_package();
        p.compiler_version = 3;
        assert!(matches!(p.validate(), Err(Error::InvalidModel(_))));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let mut p = minimal_package();
        let mut dup = p.subgraphs[0].clone();
        dup.name = "sg1".into();
        dup.inputs = vec![tensor_info("out", vec![1, 4], DataType::Float32)];
        p.subgraphs.push(dup);
        p.topo_order.push("sg1".into());
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("more than one subgraph"));
    }

    #[test]
    fn test_missing_section_rejected() {
        let mut p = minimal_package();
        p.subgraphs[0].processor = Processor::Npu;
        assert!(matches!(p.validate(), Err(Error::InvalidModel(_))));
    }

    #[test]
    fn test_user_size() {
        let info = tensor_info("in", vec![1, 3, 224, 224], DataType::Uint8);
        assert_eq!(info.user_size(), 150_528);
    }

    #[test]
    fn test_save_load_round_trip() {
        let package = minimal_package();
        let file = tempfile::NamedTempFile::new().unwrap();
        package.save(file.path()).unwrap();
        let loaded = ModelPackage::load(file.path()).unwrap();
        assert_eq!(loaded.model_name, package.model_name);
        assert_eq!(loaded.topo_order, package.topo_order);
        assert_eq!(loaded.subgraphs.len(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = ModelPackage::load("/nonexistent/model.nxpkg").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
