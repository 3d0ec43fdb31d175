//! Configuration structures and loading logic

use crate::supervisor::SupervisorSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Locations probed when `llama-server` is neither configured nor on `PATH`
const FALLBACK_BINARY_PATHS: &[&str] = &[
    "/app/llama-server",
    "/usr/local/bin/llama-server",
    "/usr/bin/llama-server",
];

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Facade listen address
    pub host: String,
    pub port: u16,

    /// Directory containing `embeddings/` and `rerankers/`
    pub models_dir: PathBuf,

    /// Explicit llama-server binary; resolved from PATH when unset
    pub llama_server_path: Option<String>,

    /// Address llama-server binds to
    pub server_host: String,

    /// First port handed out to discovered models
    pub base_port: u16,

    pub unload_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub health_probe_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub request_timeout_secs: u64,

    pub threads: u32,
    pub no_mmap: bool,

    pub embedding: ResourceSettings,
    pub reranking: ResourceSettings,

    /// Additional CLI args appended to every llama-server invocation
    pub extra_args: Vec<String>,

    /// Environment passed through to llama-server (GPU selection etc.)
    pub server_env: BTreeMap<String, String>,

    /// Directory for per-model llama-server logs
    pub log_dir: PathBuf,

    pub embedding_failure_policy: EmbeddingFailurePolicy,

    /// Zero-vector width used before a model has returned any embedding
    pub fallback_embedding_dimensions: usize,
}

/// Per-role resource parameters handed to llama-server verbatim
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceSettings {
    /// `--n-gpu-layers`; -1 offloads every layer, 0 omits the flag
    pub gpu_layers: i32,
    pub context_size: u32,
    pub batch_size: u32,
}

impl ResourceSettings {
    pub fn embedding_defaults() -> Self {
        Self {
            gpu_layers: 20,
            context_size: 8192,
            batch_size: 512,
        }
    }

    pub fn reranking_defaults() -> Self {
        Self {
            gpu_layers: 15,
            context_size: 1024,
            batch_size: 512,
        }
    }
}

/// What the facade does when a single text cannot be embedded
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingFailurePolicy {
    /// Substitute a zero vector and keep the rest of the batch
    #[default]
    ZeroVector,
    /// Fail the whole request
    Fail,
}

impl FromStr for EmbeddingFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero_vector" | "zero" => Ok(Self::ZeroVector),
            "fail" => Ok(Self::Fail),
            other => anyhow::bail!("Unknown embedding failure policy '{}'", other),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            models_dir: PathBuf::from("./models"),
            llama_server_path: None,
            server_host: "127.0.0.1".to_string(),
            base_port: default_base_port(),
            unload_timeout_secs: 300,
            sweep_interval_secs: 30,
            startup_timeout_secs: 120,
            health_poll_interval_ms: 1000,
            health_probe_timeout_secs: 5,
            stop_grace_secs: 10,
            request_timeout_secs: 120,
            threads: 8,
            no_mmap: false,
            embedding: ResourceSettings::embedding_defaults(),
            reranking: ResourceSettings::reranking_defaults(),
            extra_args: Vec::new(),
            server_env: BTreeMap::new(),
            log_dir: default_log_dir(),
            embedding_failure_policy: EmbeddingFailurePolicy::default(),
            fallback_embedding_dimensions: 768,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        env_override("PORT", &mut self.port)?;
        if let Ok(dir) = std::env::var("MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        env_override("UNLOAD_TIMEOUT", &mut self.unload_timeout_secs)?;
        if let Ok(path) = std::env::var("LLAMA_SERVER_PATH") {
            self.llama_server_path = Some(path);
        }

        // GPU layers and batch size apply to both roles; the reranker context
        // stays at its own default.
        if let Some(layers) = env_value::<i32>("LLAMA_N_GPU_LAYERS")? {
            self.embedding.gpu_layers = layers;
            self.reranking.gpu_layers = layers;
        }
        env_override("LLAMA_N_CTX", &mut self.embedding.context_size)?;
        if let Some(batch) = env_value::<u32>("LLAMA_N_BATCH")? {
            self.embedding.batch_size = batch;
            self.reranking.batch_size = batch;
        }
        env_override("LLAMA_N_THREADS", &mut self.threads)?;
        if let Ok(no_mmap) = std::env::var("LLAMA_NO_MMAP") {
            self.no_mmap = no_mmap.eq_ignore_ascii_case("true");
        }
        env_override("LLAMA_STARTUP_TIMEOUT", &mut self.startup_timeout_secs)?;
        if let Ok(dir) = std::env::var("LLAMA_MANAGER_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        env_override("EMBEDDING_FAILURE_POLICY", &mut self.embedding_failure_policy)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("API port must be non-zero");
        }
        if self.base_port < 1024 {
            anyhow::bail!("Model base port must be >= 1024 (got {})", self.base_port);
        }
        if self.unload_timeout_secs == 0 {
            anyhow::bail!("unload_timeout_secs must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be greater than zero");
        }
        if self.startup_timeout_secs == 0 || self.health_poll_interval_ms == 0 {
            anyhow::bail!("Startup timeout and health poll interval must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.threads == 0 {
            anyhow::bail!("threads must be greater than zero");
        }
        if self.fallback_embedding_dimensions == 0 {
            anyhow::bail!("fallback_embedding_dimensions must be greater than zero");
        }
        if self.server_env.keys().any(|key| key.is_empty() || key.contains('=')) {
            anyhow::bail!("server_env keys must be non-empty and must not contain '='");
        }

        Ok(())
    }

    /// Reject model ports that collide with the facade listener
    pub fn validate_model_ports(&self, ports: impl IntoIterator<Item = u16>) -> Result<()> {
        for port in ports {
            if port == self.port {
                anyhow::bail!(
                    "Model port {} conflicts with API port; move base_port",
                    port
                );
            }
        }
        Ok(())
    }

    /// Locate the llama-server binary
    pub fn resolve_llama_server(&self) -> Result<PathBuf> {
        if let Some(path) = &self.llama_server_path {
            let path = PathBuf::from(path);
            if path.components().count() == 1 {
                return which::which(&path)
                    .with_context(|| format!("llama-server binary {:?} not found on PATH", path));
            }
            return Ok(path);
        }

        if let Ok(path) = which::which("llama-server") {
            return Ok(path);
        }

        FALLBACK_BINARY_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
            .context("llama-server binary not found")
    }

    /// Build the settings shared by every supervised process
    pub fn supervisor_settings(&self, binary_path: PathBuf) -> SupervisorSettings {
        SupervisorSettings {
            binary_path,
            server_host: self.server_host.clone(),
            threads: self.threads,
            no_mmap: self.no_mmap,
            extra_args: self.extra_args.clone(),
            env: self.server_env.clone(),
            log_dir: Some(self.log_dir.clone()),
            health_poll_interval: Duration::from_millis(self.health_poll_interval_ms),
            health_probe_timeout: Duration::from_secs(self.health_probe_timeout_secs),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse an environment variable, returning `None` when it is unset
fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_value(name)? {
        *target = value;
    }
    Ok(())
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_base_port() -> u16 {
    8001
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/llama-embed-manager/logs")
}
