//! GPU backend detection
//!
//! llama-server picks its accelerator from environment variables. The manager
//! reports what those variables select so operators can see it on `/health`.
//! Variables configured in `server_env` take precedence over the manager's own
//! environment, matching what the subprocess actually receives.

use serde::Serialize;
use std::collections::BTreeMap;

/// Accelerator selected for llama-server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBackend {
    VulkanForced,
    Vulkan,
    Rocm,
    Cpu,
}

impl std::fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::VulkanForced => "Vulkan (Forced/Pure)",
            Self::Vulkan => "Vulkan (Primary)",
            Self::Rocm => "ROCm (HSA Override)",
            Self::Cpu => "CPU (No GPU acceleration)",
        };
        f.write_str(label)
    }
}

impl Serialize for GpuBackend {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What `/health` reports about the accelerator
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub gpu_backend: GpuBackend,
    pub vulkan_device: String,
    pub performance_mode: String,
}

impl GpuInfo {
    /// Detect from `server_env`, falling back to the process environment
    pub fn detect(server_env: &BTreeMap<String, String>) -> Self {
        Self::detect_with(|key| {
            server_env
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn detect_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let is_set = |key: &str| lookup(key).is_some_and(|v| v.trim() == "1");
        let forced = is_set("LLAMA_VULKAN_FORCE");

        let gpu_backend = if is_set("LLAMA_VULKAN") {
            if forced {
                GpuBackend::VulkanForced
            } else {
                GpuBackend::Vulkan
            }
        } else if lookup("HSA_OVERRIDE_GFX_VERSION").is_some_and(|v| !v.is_empty()) {
            GpuBackend::Rocm
        } else {
            GpuBackend::Cpu
        };

        let info = Self {
            gpu_backend,
            vulkan_device: lookup("VULKAN_DEVICE").unwrap_or_else(|| "auto".to_string()),
            performance_mode: if forced { "maximum" } else { "balanced" }.to_string(),
        };

        tracing::info!(
            gpu_backend = %info.gpu_backend,
            vulkan_device = %info.vulkan_device,
            performance_mode = %info.performance_mode,
            "Detected GPU backend"
        );

        info
    }
}
