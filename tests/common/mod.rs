//! Shared fakes for integration tests
//!
//! The fakes implement the public `ProcessControl` and `BackendClient` traits
//! so the full manager and API stack runs without a llama-server binary.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum_test::TestServer;
use llama_embed_manager::{
    BackendClient, EmbeddingFailurePolicy, ManagerOptions, ModelRegistry, ProcessControl,
    ProcessHandle, ServerManager, SpawnConfig, StopSignal, SupervisorSettings,
    api::{AppState, create_router},
    gpu::GpuInfo,
    models::ScanSettings,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Letter-frequency embedding; identical texts score 1.0
pub fn letter_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 26];
    for c in text.to_ascii_lowercase().chars() {
        if c.is_ascii_lowercase() {
            vector[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    vector
}

#[derive(Default)]
pub struct FakeProcessControl {
    alive: Mutex<HashMap<String, bool>>,
    configs: Mutex<Vec<SpawnConfig>>,
    next_id: AtomicU32,
}

impl FakeProcessControl {
    pub fn spawn_count(&self) -> usize {
        self.configs.lock().unwrap().len()
    }

    pub fn spawned_models(&self) -> Vec<String> {
        self.configs
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().unwrap().values().filter(|a| **a).count()
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ProcessHandle::new(format!("fake_{}", id));
        self.alive
            .lock()
            .unwrap()
            .insert(handle.id().to_string(), true);
        self.configs.lock().unwrap().push(config);
        Ok(handle)
    }

    async fn signal(&self, handle: &ProcessHandle, _signal: StopSignal) -> Result<()> {
        if let Some(alive) = self.alive.lock().unwrap().get_mut(handle.id()) {
            *alive = false;
        }
        Ok(())
    }

    async fn wait(&self, handle: &ProcessHandle, _timeout: Duration) -> Result<bool> {
        Ok(!self.is_alive(handle).await)
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.alive
            .lock()
            .unwrap()
            .get(handle.id())
            .copied()
            .unwrap_or(false)
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        if self.is_alive(handle).await {
            handle.id().trim_start_matches("fake_").parse::<u32>().ok().map(|n| n + 4000)
        } else {
            None
        }
    }

    async fn release(&self, handle: ProcessHandle) {
        self.alive.lock().unwrap().remove(handle.id());
    }
}

pub struct FakeBackend {
    healthy: AtomicBool,
    failing_texts: Mutex<HashSet<String>>,
    posts: AtomicU32,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            failing_texts: Mutex::new(HashSet::new()),
            posts: AtomicU32::new(0),
        }
    }
}

impl FakeBackend {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn fail_text(&self, text: &str) {
        self.failing_texts.lock().unwrap().insert(text.to_string());
    }

    pub fn post_count(&self) -> u32 {
        self.posts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn health(&self, _port: u16, _timeout: Duration) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn post_json(
        &self,
        _port: u16,
        _endpoint: &str,
        payload: &Value,
        _timeout: Duration,
    ) -> Result<Value> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let text = payload["content"].as_str().unwrap_or_default();
        if self.failing_texts.lock().unwrap().contains(text) {
            anyhow::bail!("llama-server returned status 500 Internal Server Error");
        }
        Ok(json!({ "embedding": letter_embedding(text) }))
    }
}

/// Create `<dir>/<sub>/<file>` with placeholder content
pub fn touch_model(dir: &Path, sub: &str, file: &str) {
    let path = dir.join(sub);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join(file), b"GGUF").unwrap();
}

/// Models directory with two embedding models and one reranker
pub fn models_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    touch_model(dir.path(), "embeddings", "nomic.gguf");
    touch_model(dir.path(), "embeddings", "minilm.gguf");
    touch_model(dir.path(), "rerankers", "bge.gguf");
    dir
}

pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        health_poll_interval: Duration::from_millis(10),
        startup_timeout: Duration::from_millis(300),
        stop_grace: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub struct TestContext {
    pub server: TestServer,
    pub manager: Arc<ServerManager>,
    pub control: Arc<FakeProcessControl>,
    pub backend: Arc<FakeBackend>,
    _models: TempDir,
}

pub fn context(options: ManagerOptions, policy: EmbeddingFailurePolicy) -> TestContext {
    let models = models_dir();
    let catalog = ModelRegistry::scan(models.path(), &ScanSettings::default()).unwrap();

    let control = Arc::new(FakeProcessControl::default());
    let backend = Arc::new(FakeBackend::default());
    let manager = ServerManager::new(
        catalog,
        fast_settings(),
        control.clone(),
        backend.clone(),
        options,
    );

    let state = AppState {
        manager: manager.clone(),
        gpu: Arc::new(GpuInfo::detect_with(|_| None)),
        failure_policy: policy,
        fallback_dimensions: 768,
        prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
    };

    let server = TestServer::new(create_router(state));

    TestContext {
        server,
        manager,
        control,
        backend,
        _models: models,
    }
}

pub fn default_context() -> TestContext {
    context(ManagerOptions::default(), EmbeddingFailurePolicy::ZeroVector)
}
