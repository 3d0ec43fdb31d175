//! Lazily populated map of supervised llama-servers

use crate::backend::{BackendClient, HttpBackendClient};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::models::ModelRegistry;
use crate::process::{ProcessControl, SystemProcessControl};
use crate::supervisor::{ProcessState, ServerStatus, SupervisedProcess, SupervisorSettings};
use crate::sweeper::IdleSweeper;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Idle eviction timing
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl From<&ManagerConfig> for ManagerOptions {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Outcome of stopping every server
#[derive(Debug, Default, Clone, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
    /// `(model, reason)` for servers whose shutdown reported an error
    pub failures: Vec<(String, String)>,
}

/// Owns one `SupervisedProcess` per model that has been asked for.
///
/// Entries are created on first use and removed when stopped or evicted for
/// idleness. A background sweep is started with the first entry.
pub struct ServerManager {
    catalog: Arc<ModelRegistry>,
    settings: Arc<SupervisorSettings>,
    control: Arc<dyn ProcessControl>,
    backend: Arc<dyn BackendClient>,
    options: ManagerOptions,
    servers: RwLock<HashMap<String, Arc<SupervisedProcess>>>,
    sweeper: OnceLock<JoinHandle<()>>,
    cancel: CancellationToken,
    self_ref: Weak<ServerManager>,
}

impl ServerManager {
    pub fn new(
        catalog: ModelRegistry,
        settings: SupervisorSettings,
        control: Arc<dyn ProcessControl>,
        backend: Arc<dyn BackendClient>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            catalog: Arc::new(catalog),
            settings: Arc::new(settings),
            control,
            backend,
            options,
            servers: RwLock::new(HashMap::new()),
            sweeper: OnceLock::new(),
            cancel: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Production wiring: real processes and an HTTP backend
    pub fn from_config(config: &ManagerConfig, catalog: ModelRegistry) -> Result<Arc<Self>> {
        let binary_path = config.resolve_llama_server()?;
        tracing::info!(binary = %binary_path.display(), "Using llama-server binary");

        let settings = config.supervisor_settings(binary_path);
        let backend = HttpBackendClient::new(&config.server_host)?;

        Ok(Self::new(
            catalog,
            settings,
            Arc::new(SystemProcessControl::new()),
            Arc::new(backend),
            ManagerOptions::from(config),
        ))
    }

    pub fn catalog(&self) -> &ModelRegistry {
        &self.catalog
    }

    pub fn options(&self) -> ManagerOptions {
        self.options
    }

    /// Started server for `model`, creating the entry on first use
    pub async fn get_server(&self, model: &str) -> ManagerResult<Arc<SupervisedProcess>> {
        loop {
            let server = self.entry(model).await?;
            match server.start().await {
                Ok(()) => {
                    self.update_running_gauge();
                    return Ok(server);
                }
                Err(ManagerError::Evicted { .. }) => self.forget(model, &server).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Forward a request to `model`, starting its server if needed
    pub async fn proxy(&self, model: &str, endpoint: &str, payload: &Value) -> ManagerResult<Value> {
        loop {
            let server = self.entry(model).await?;
            match server.proxy(endpoint, payload).await {
                Err(ManagerError::Evicted { .. }) => self.forget(model, &server).await,
                result => {
                    self.update_running_gauge();
                    return result;
                }
            }
        }
    }

    /// Embed one text with `model`
    pub async fn embed(&self, model: &str, text: &str) -> ManagerResult<Vec<f32>> {
        loop {
            let server = self.entry(model).await?;
            match crate::proxy::embed_text(&server, text).await {
                Err(ManagerError::Evicted { .. }) => self.forget(model, &server).await,
                result => {
                    self.update_running_gauge();
                    return result;
                }
            }
        }
    }

    /// Stop and remove `model`'s server if it has one; any other name is a
    /// no-op. Shutdown errors are logged, not returned.
    pub async fn stop_server(&self, model: &str) -> ManagerResult<()> {
        let server = self.servers.read().await.get(model).cloned();
        let Some(server) = server else {
            tracing::debug!(model = %model, "No server to stop");
            return Ok(());
        };

        if let Err(e) = server.retire().await {
            tracing::warn!(model = %model, error = %e, "Error while stopping server");
        }
        self.forget(model, &server).await;
        self.update_running_gauge();

        tracing::info!(model = %model, "Server stopped and removed");
        Ok(())
    }

    /// Stop every server concurrently; all entries are removed regardless of
    /// individual failures
    pub async fn stop_all(&self) -> StopReport {
        let servers: Vec<Arc<SupervisedProcess>> =
            self.servers.read().await.values().cloned().collect();

        let results = futures::future::join_all(servers.iter().map(|server| async move {
            (server.name().to_string(), server.retire().await)
        }))
        .await;

        for server in &servers {
            self.forget(server.name(), server).await;
        }

        let mut report = StopReport::default();
        for (model, result) in results {
            match result {
                Ok(()) => report.stopped.push(model),
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "Error while stopping server");
                    report.failures.push((model, e.to_string()));
                }
            }
        }

        self.update_running_gauge();
        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failures.len(),
            "All servers stopped"
        );

        report
    }

    /// One sweep cycle: stop and remove every server idle for longer than
    /// the idle timeout. Returns the evicted model names.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let servers: Vec<Arc<SupervisedProcess>> =
            self.servers.read().await.values().cloned().collect();
        let idle_timeout = self.options.idle_timeout;

        let results = futures::future::join_all(servers.iter().map(|server| async move {
            (server.clone(), server.retire_if_idle(idle_timeout).await)
        }))
        .await;

        let mut evicted = Vec::new();
        for (server, result) in results {
            let Some(result) = result else { continue };

            if let Err(e) = result {
                tracing::warn!(model = %server.name(), error = %e, "Error while stopping idle server");
            }
            self.forget(server.name(), &server).await;
            crate::metrics::record_idle_eviction(server.name());
            evicted.push(server.name().to_string());
        }

        if !evicted.is_empty() {
            self.update_running_gauge();
            tracing::info!(evicted = ?evicted, "Idle servers stopped");
        }

        evicted.sort();
        evicted
    }

    /// Cancel the sweep and stop everything
    pub async fn shutdown(&self) -> StopReport {
        tracing::info!("Shutting down server manager");
        self.cancel.cancel();
        self.stop_all().await
    }

    /// Models whose server is currently running
    pub async fn running_models(&self) -> Vec<String> {
        let servers = self.servers.read().await;
        let mut running: Vec<String> = servers
            .values()
            .filter(|s| s.state() == ProcessState::Running)
            .map(|s| s.name().to_string())
            .collect();
        running.sort();
        running
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let servers: Vec<Arc<SupervisedProcess>> =
            self.servers.read().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(servers.len());
        for server in servers {
            statuses.push(server.status().await);
        }
        statuses.sort_by(|a, b| a.model.cmp(&b.model));
        statuses
    }

    /// Last embedding width observed from `model`'s current server
    pub async fn embedding_dimensions(&self, model: &str) -> Option<usize> {
        let servers = self.servers.read().await;
        servers.get(model).and_then(|s| s.embedding_dimensions())
    }

    /// Whether the background sweep task is alive
    pub fn sweeper_running(&self) -> bool {
        self.sweeper.get().is_some_and(|handle| !handle.is_finished())
    }

    async fn entry(&self, model: &str) -> ManagerResult<Arc<SupervisedProcess>> {
        if let Some(server) = self.servers.read().await.get(model) {
            return Ok(server.clone());
        }

        let descriptor = self
            .catalog
            .get(model)
            .ok_or_else(|| ManagerError::UnknownModel {
                model: model.to_string(),
            })?;

        let server = {
            let mut servers = self.servers.write().await;
            servers
                .entry(model.to_string())
                .or_insert_with(|| {
                    tracing::debug!(model = %model, port = descriptor.port, "Creating server entry");
                    Arc::new(SupervisedProcess::new(
                        descriptor,
                        self.settings.clone(),
                        self.control.clone(),
                        self.backend.clone(),
                    ))
                })
                .clone()
        };

        self.ensure_sweeper();
        Ok(server)
    }

    /// Remove `server` from the map unless it was already replaced
    async fn forget(&self, model: &str, server: &Arc<SupervisedProcess>) {
        let mut servers = self.servers.write().await;
        if servers.get(model).is_some_and(|s| Arc::ptr_eq(s, server)) {
            servers.remove(model);
        }
    }

    fn ensure_sweeper(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.sweeper.get_or_init(|| {
            IdleSweeper::new(
                self.self_ref.clone(),
                self.options.sweep_interval,
                self.cancel.child_token(),
            )
            .spawn()
        });
    }

    fn update_running_gauge(&self) {
        if let Ok(servers) = self.servers.try_read() {
            let running = servers
                .values()
                .filter(|s| s.state() == ProcessState::Running)
                .count();
            crate::metrics::update_running_servers(running);
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mocks::MockBackend;
    use crate::models::ModelRole;
    use crate::process::mocks::MockProcessControl;
    use crate::supervisor::test_support::descriptor;
    use serde_json::json;

    struct Fixture {
        manager: Arc<ServerManager>,
        control: Arc<MockProcessControl>,
        backend: Arc<MockBackend>,
    }

    fn catalog() -> ModelRegistry {
        ModelRegistry::from_descriptors([
            (*descriptor("embedding_a", ModelRole::Embedding, 8001)).clone(),
            (*descriptor("embedding_b", ModelRole::Embedding, 8002)).clone(),
            (*descriptor("reranker_r", ModelRole::Reranking, 8003)).clone(),
        ])
    }

    fn fixture(options: ManagerOptions) -> Fixture {
        let control = Arc::new(MockProcessControl::new());
        let backend = Arc::new(MockBackend::new());
        let settings = SupervisorSettings {
            health_poll_interval: Duration::from_millis(10),
            startup_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = ServerManager::new(
            catalog(),
            settings,
            control.clone(),
            backend.clone(),
            options,
        );
        Fixture {
            manager,
            control,
            backend,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(ManagerOptions::default())
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let f = default_fixture();
        let err = f.manager.get_server("embedding_missing").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownModel { .. }));
        assert_eq!(f.control.spawn_count(), 0);
        assert!(!f.manager.sweeper_running());
    }

    #[tokio::test]
    async fn test_get_server_is_idempotent() {
        let f = default_fixture();
        let first = f.manager.get_server("embedding_a").await.unwrap();
        let second = f.manager.get_server("embedding_a").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.control.spawn_count(), 1);
        assert_eq!(f.manager.running_models().await, vec!["embedding_a"]);
    }

    #[tokio::test]
    async fn test_concurrent_get_server_spawns_once() {
        let f = default_fixture();
        f.backend.set_warmup_probes(5);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = f.manager.clone();
                tokio::spawn(async move { manager.get_server("embedding_a").await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(f.control.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_server_removes_entry() {
        let f = default_fixture();
        f.manager.get_server("embedding_a").await.unwrap();

        f.manager.stop_server("embedding_a").await.unwrap();
        assert!(f.manager.running_models().await.is_empty());
        assert!(f.manager.statuses().await.is_empty());
        assert_eq!(f.control.alive_count().await, 0);

        // Stopping again, or stopping a name that was never seen, is a no-op
        f.manager.stop_server("embedding_a").await.unwrap();
        f.manager.stop_server("never_seen").await.unwrap();
        assert_eq!(f.control.spawn_count(), 1);
        assert!(f.manager.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_server_swallows_shutdown_errors() {
        let f = default_fixture();
        f.manager.get_server("embedding_a").await.unwrap();
        f.control.set_fail_signals(true);

        f.manager.stop_server("embedding_a").await.unwrap();
        assert!(f.manager.running_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let f = default_fixture();
        f.manager.get_server("embedding_a").await.unwrap();
        f.manager.stop_server("embedding_a").await.unwrap();
        f.manager.get_server("embedding_a").await.unwrap();

        assert_eq!(f.control.spawn_count(), 2);
        assert_eq!(f.manager.running_models().await, vec!["embedding_a"]);
    }

    #[tokio::test]
    async fn test_stop_all_reports_failures() {
        let f = default_fixture();
        f.manager.get_server("embedding_a").await.unwrap();
        f.manager.get_server("reranker_r").await.unwrap();
        f.control.set_fail_signals(true);

        let report = f.manager.stop_all().await;
        assert!(report.stopped.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(f.manager.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stops_only_idle() {
        let f = fixture(ManagerOptions {
            idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(3600),
        });

        f.manager.get_server("embedding_a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        f.manager.get_server("embedding_b").await.unwrap();

        let evicted = f.manager.sweep_idle().await;
        assert_eq!(evicted, vec!["embedding_a"]);
        assert_eq!(f.manager.running_models().await, vec!["embedding_b"]);
    }

    #[tokio::test]
    async fn test_sweep_leaves_recently_used() {
        let f = fixture(ManagerOptions {
            idle_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(3600),
        });

        f.manager.get_server("embedding_a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        f.manager
            .proxy("embedding_a", "/embedding", &json!({ "content": "hi" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(f.manager.sweep_idle().await.is_empty());
        assert_eq!(f.manager.running_models().await, vec!["embedding_a"]);
    }

    #[tokio::test]
    async fn test_background_sweep_evicts() {
        let f = fixture(ManagerOptions {
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(25),
        });

        f.manager.get_server("embedding_a").await.unwrap();
        assert!(f.manager.sweeper_running());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.manager.running_models().await.is_empty());
        assert_eq!(f.control.alive_count().await, 0);
    }

    #[tokio::test]
    async fn test_proxy_after_eviction_uses_fresh_entry() {
        let f = fixture(ManagerOptions {
            idle_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_secs(3600),
        });

        let stale = f.manager.get_server("embedding_a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Retire the entry but leave it in the map, as a racing sweep would
        stale.retire().await.unwrap();

        let embedding = f.manager.embed("embedding_a", "abc").await.unwrap();
        assert_eq!(embedding.len(), 26);
        assert_eq!(f.control.spawn_count(), 2);

        let fresh = f.manager.get_server("embedding_a").await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sweeper() {
        let f = default_fixture();
        f.manager.get_server("embedding_a").await.unwrap();
        assert!(f.manager.sweeper_running());

        let report = f.manager.shutdown().await;
        assert_eq!(report.stopped, vec!["embedding_a"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!f.manager.sweeper_running());
    }

    #[tokio::test]
    async fn test_embedding_dimensions_tracked() {
        let f = default_fixture();
        assert!(f.manager.embedding_dimensions("embedding_a").await.is_none());

        f.manager.embed("embedding_a", "hello").await.unwrap();
        assert_eq!(f.manager.embedding_dimensions("embedding_a").await, Some(26));
    }
}
