//! Runtime configuration
//!
//! A snapshot of the environment knobs plus the per-engine options. Read once
//! at engine open and passed down through handles; no global state.

use std::env;

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => {
            let v = v.trim();
            v.eq_ignore_ascii_case("on") || v.eq_ignore_ascii_case("true") || v == "1"
        }
        Err(_) => false,
    }
}

fn env_u8(name: &str) -> u8 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0)
}

/// Process-wide settings sampled from the environment
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `DXRT_DYNAMIC_CPU_THREAD=ON` enables dynamic CPU worker scaling
    pub dynamic_cpu_thread: bool,
    /// `DXRT_DEBUG_DATA=<n>` enables per-stage binary dumping
    pub debug_data: u8,
    /// `DXRT_SHOW_PROFILE=<n>` enables the end-of-run profiler summary
    pub show_profile: u8,
    /// `DXRT_SKIP_INFERENCE_IO=1` skips device payload writes/reads (bring-up)
    pub skip_inference_io: bool,
}

impl RuntimeConfig {
    /// Sample the environment
    pub fn from_env() -> Self {
        Self {
            dynamic_cpu_thread: env_flag("DXRT_DYNAMIC_CPU_THREAD"),
            debug_data: env_u8("DXRT_DEBUG_DATA"),
            show_profile: env_u8("DXRT_SHOW_PROFILE"),
            skip_inference_io: env_flag("DXRT_SKIP_INFERENCE_IO"),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dynamic_cpu_thread: false,
            debug_data: 0,
            show_profile: 0,
            skip_inference_io: false,
        }
    }
}

/// Per-engine options supplied at [`crate::engine::InferenceEngine::open`]
#[derive(Clone)]
pub struct EngineOptions {
    /// Restrict scheduling to these device ids (empty = all discovered)
    pub device_ids: Vec<usize>,
    /// In-flight request slots per task per device
    pub buffer_count: usize,
    /// Override the sampled environment configuration
    pub runtime: Option<RuntimeConfig>,
    /// Static CPU worker threads per CPU task
    pub cpu_threads: usize,
    /// Enable the profiler regardless of `DXRT_SHOW_PROFILE`
    pub profiler: bool,
    /// Builds CPU executors from subgraph model blobs; defaults to the
    /// ONNX-backed executor when the `onnx` feature is enabled
    pub cpu_executor_factory: Option<crate::cpu::CpuExecutorFactory>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_ids: Vec::new(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            runtime: None,
            cpu_threads: 1,
            profiler: false,
            cpu_executor_factory: None,
        }
    }
}

/// Default per-task in-flight slots per device
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Device-memory allocation granularity in bytes
pub const MEM_ALIGN: u64 = 64;

/// Page alignment for host-side buffer pool slots
pub const PAGE_ALIGN: usize = 4096;

/// Round `n` up to a multiple of `align` (power of two not required)
pub fn align_up(n: u64, align: u64) -> u64 {
    if align == 0 {
        return n;
    }
    n.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(10, 0), 10);
    }

    #[test]
    fn test_env_flag_parses_on() {
        env::set_var("NEUTRON_TEST_FLAG_X", "ON");
        assert!(env_flag("NEUTRON_TEST_FLAG_X"));
        env::set_var("NEUTRON_TEST_FLAG_X", "off");
        assert!(!env_flag("NEUTRON_TEST_FLAG_X"));
        env::remove_var("NEUTRON_TEST_FLAG_X");
    }
}
