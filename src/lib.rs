//! llama-embed-manager - On-demand llama-server manager
//!
//! Discovers GGUF embedding and reranking models, starts one llama-server
//! subprocess per model when it is first requested, stops servers that sit
//! idle, and serves an OpenAI-compatible embeddings and rerank API in front
//! of them.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod gpu;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod process;
pub mod proxy;
pub mod rerank;
pub mod supervisor;
pub mod sweeper;

pub use backend::{BackendClient, HttpBackendClient};
pub use config::{EmbeddingFailurePolicy, ManagerConfig, ResourceSettings};
pub use error::{ApiError, ManagerError, ManagerResult};
pub use manager::{ManagerOptions, ServerManager, StopReport};
pub use models::{ModelDescriptor, ModelRegistry, ModelRole};
pub use process::{ProcessControl, ProcessHandle, SpawnConfig, StopSignal, SystemProcessControl};
pub use supervisor::{ProcessState, ServerStatus, SupervisedProcess, SupervisorSettings};
pub use sweeper::IdleSweeper;
