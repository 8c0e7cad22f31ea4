//! Shared fixtures: synthetic model packages, loopback devices and
//! closure-backed CPU executors.

#![allow(dead_code)]

use std::sync::Arc;

use neutron_runtime::codec::{Layout, TransposeKind};
use neutron_runtime::cpu::{CpuExecutor, CpuExecutorFactory, CpuIo, CpuIoMut};
use neutron_runtime::driver::loopback::LoopbackDriver;
use neutron_runtime::driver::DriverAdapter;
use neutron_runtime::model::{
    CpuSubGraph, ModelPackage, NpuModelKind, NpuSubGraph, Processor, SubGraphInfo, TensorInfo,
};
use neutron_runtime::tensor::{DataType, MemoryKind};
use neutron_runtime::{EngineOptions, Result, RuntimeConfig};

pub fn tinfo(name: &str, shape: &[i64], dtype: DataType) -> TensorInfo {
    TensorInfo {
        name: name.into(),
        dtype,
        shape: shape.to_vec(),
        dtype_encoded: dtype,
        shape_encoded: shape.to_vec(),
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

fn lay_out(tensors: &mut [TensorInfo]) -> u64 {
    let mut offset = 0u64;
    for t in tensors.iter_mut() {
        t.encoded_offset = offset;
        t.encoded_size = t.user_size();
        offset += t.encoded_size;
    }
    offset
}

pub fn npu_subgraph(
    name: &str,
    kind: NpuModelKind,
    mut inputs: Vec<TensorInfo>,
    mut outputs: Vec<TensorInfo>,
) -> SubGraphInfo {
    let encoded_input_size = lay_out(&mut inputs);
    let encoded_output_size = lay_out(&mut outputs);
    SubGraphInfo {
        name: name.into(),
        processor: Processor::Npu,
        inputs,
        outputs,
        npu: Some(NpuSubGraph {
            kind,
            rmap: vec![0x11; 128],
            weight: vec![0x22; 256],
            ppu_binary: None,
            encoded_input_size,
            encoded_output_size,
            output_mem_size: encoded_output_size.max(64),
            output_all_offset: 0,
            last_output_offset: 0,
            ppu_filter_max: 64,
        }),
        cpu: None,
    }
}

pub fn cpu_subgraph(
    name: &str,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
) -> SubGraphInfo {
    SubGraphInfo {
        name: name.into(),
        processor: Processor::Cpu,
        inputs,
        outputs,
        npu: None,
        cpu: Some(CpuSubGraph { model: vec![0; 16] }),
    }
}

pub fn package(
    inputs: &[&str],
    outputs: &[&str],
    subgraphs: Vec<SubGraphInfo>,
) -> ModelPackage {
    ModelPackage {
        model_name: "fixture".into(),
        file_format_version: 7,
        compiler_version: 7,
        compile_type: "mixed".into(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        topo_order: subgraphs.iter().map(|s| s.name.clone()).collect(),
        subgraphs,
    }
}

/// Serialize a package into a temp file that lives as long as the guard.
pub fn write_package(package: &ModelPackage) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    package.save(file.path()).expect("save package");
    file
}

pub fn loopback() -> Arc<LoopbackDriver> {
    Arc::new(LoopbackDriver::new(16 << 20, 2))
}

pub fn adapters(drivers: &[Arc<LoopbackDriver>]) -> Vec<Arc<dyn DriverAdapter>> {
    drivers
        .iter()
        .map(|d| Arc::clone(d) as Arc<dyn DriverAdapter>)
        .collect()
}

/// Closure-backed executor for CPU subgraphs
pub struct FnExecutor(
    pub Box<dyn Fn(&[CpuIo<'_>], &mut [CpuIoMut<'_>]) -> Result<()> + Send + Sync>,
);

impl CpuExecutor for FnExecutor {
    fn run(&self, inputs: &[CpuIo<'_>], outputs: &mut [CpuIoMut<'_>]) -> Result<()> {
        (self.0)(inputs, outputs)
    }
}

pub fn factory_of(
    f: impl Fn(&[CpuIo<'_>], &mut [CpuIoMut<'_>]) -> Result<()> + Send + Sync + Clone + 'static,
) -> CpuExecutorFactory {
    Arc::new(move |_blob: &[u8]| {
        let f = f.clone();
        Ok(Box::new(FnExecutor(Box::new(f))) as Box<dyn CpuExecutor>)
    })
}

pub fn options_with(factory: Option<CpuExecutorFactory>, buffer_count: usize) -> EngineOptions {
    EngineOptions {
        buffer_count,
        runtime: Some(RuntimeConfig::default()),
        cpu_executor_factory: factory,
        ..Default::default()
    }
}
