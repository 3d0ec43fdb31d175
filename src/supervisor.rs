//! Lifecycle of a single llama-server subprocess

use crate::backend::BackendClient;
use crate::error::{ManagerError, ManagerResult};
use crate::models::ModelDescriptor;
use crate::process::{ProcessControl, ProcessHandle, SpawnConfig, StopSignal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;

/// How long to wait for exit after SIGKILL before giving up
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Settings shared by every supervised llama-server
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub binary_path: PathBuf,
    /// `--host` passed to llama-server
    pub server_host: String,
    pub threads: u32,
    pub no_mmap: bool,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub log_dir: Option<PathBuf>,
    pub health_poll_interval: Duration,
    pub health_probe_timeout: Duration,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub request_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("llama-server"),
            server_host: "127.0.0.1".to_string(),
            threads: 8,
            no_mmap: false,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            log_dir: None,
            health_poll_interval: Duration::from_secs(1),
            health_probe_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }
}

/// Point-in-time view of a supervised server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub model: String,
    pub port: u16,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub healthy: bool,
    pub idle_secs: u64,
    pub uptime_secs: Option<i64>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub embedding_dimensions: Option<usize>,
}

/// State guarded by the per-entry lock
#[derive(Debug)]
struct Inner {
    state: ProcessState,
    handle: Option<ProcessHandle>,
    healthy: bool,
    /// Set once the manager has evicted this entry; it never starts again
    retired: bool,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Stop sequence in flight; outlives the caller that started it
    stopping: Option<JoinHandle<ManagerResult<()>>>,
}

/// Owns at most one llama-server process for one model.
///
/// Start and stop hold the write lock for their whole duration; proxied
/// requests hold the read lock, so requests to the same model run
/// concurrently but never overlap a transition.
pub struct SupervisedProcess {
    descriptor: Arc<ModelDescriptor>,
    settings: Arc<SupervisorSettings>,
    control: Arc<dyn ProcessControl>,
    backend: Arc<dyn BackendClient>,
    inner: RwLock<Inner>,
    /// Mirror of `Inner::state` readable without the lock
    phase: AtomicU8,
    created: Instant,
    /// Milliseconds since `created` at last use
    last_used_ms: AtomicU64,
    /// Last observed embedding width; 0 until the first response
    dimensions: AtomicUsize,
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("model", &self.descriptor.name)
            .field("port", &self.descriptor.port)
            .field("state", &self.state())
            .finish()
    }
}

impl SupervisedProcess {
    pub fn new(
        descriptor: Arc<ModelDescriptor>,
        settings: Arc<SupervisorSettings>,
        control: Arc<dyn ProcessControl>,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            control,
            backend,
            inner: RwLock::new(Inner {
                state: ProcessState::Stopped,
                handle: None,
                healthy: false,
                retired: false,
                started_at: None,
                stopping: None,
            }),
            phase: AtomicU8::new(ProcessState::Stopped.as_u8()),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            dimensions: AtomicUsize::new(0),
        }
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn port(&self) -> u16 {
        self.descriptor.port
    }

    /// Current state without waiting for an in-flight transition
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Command line for this model's llama-server
    pub fn spawn_config(&self) -> SpawnConfig {
        let d = &self.descriptor;
        let s = &self.settings;

        let mut args = vec![
            "--model".to_string(),
            d.path.to_string_lossy().to_string(),
            "--port".to_string(),
            d.port.to_string(),
            "--host".to_string(),
            s.server_host.clone(),
            "--embeddings".to_string(),
            "--ctx-size".to_string(),
            d.resources.context_size.to_string(),
            "--batch-size".to_string(),
            d.resources.batch_size.to_string(),
            "--threads".to_string(),
            s.threads.to_string(),
            if s.no_mmap { "--no-mmap" } else { "--mmap" }.to_string(),
        ];

        if d.resources.gpu_layers != 0 {
            args.push("--n-gpu-layers".to_string());
            args.push(d.resources.gpu_layers.to_string());
        }

        args.extend(s.extra_args.iter().cloned());

        SpawnConfig {
            name: d.name.clone(),
            program: s.binary_path.clone(),
            args,
            env: s.env.clone(),
            log_dir: s.log_dir.clone(),
        }
    }

    /// Start llama-server and wait until it reports healthy.
    ///
    /// Returns immediately if already running.
    pub async fn start(&self) -> ManagerResult<()> {
        let mut inner = self.inner.write().await;
        self.start_locked(&mut inner).await
    }

    /// Stop llama-server: SIGTERM, grace period, then SIGKILL.
    ///
    /// A no-op when already stopped. The supervisor always ends `Stopped`;
    /// signalling failures are returned as `ShutdownError`.
    pub async fn stop(&self) -> ManagerResult<()> {
        let mut inner = self.inner.write().await;
        self.terminate(&mut inner).await
    }

    /// Alive and healthy as of the last probe
    pub async fn is_running(&self) -> bool {
        let inner = self.inner.read().await;
        self.is_live(&inner).await
    }

    /// Forward `payload` to `endpoint`, starting the server first if needed
    pub async fn proxy(&self, endpoint: &str, payload: &Value) -> ManagerResult<Value> {
        self.touch();

        let result = async {
            let _guard = self.ensure_running().await?;
            crate::proxy::forward(
                self.backend.as_ref(),
                &self.descriptor,
                endpoint,
                payload,
                self.settings.request_timeout,
            )
            .await
        }
        .await;

        self.touch();
        result
    }

    pub fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_used_ms.store(now, Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst));
        self.created.elapsed().saturating_sub(last)
    }

    pub fn embedding_dimensions(&self) -> Option<usize> {
        match self.dimensions.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn record_dimensions(&self, dimensions: usize) {
        if dimensions > 0 {
            self.dimensions.store(dimensions, Ordering::SeqCst);
        }
    }

    pub async fn status(&self) -> ServerStatus {
        let (pid, healthy, started_at) = match self.inner.try_read() {
            Ok(inner) => {
                let pid = match &inner.handle {
                    Some(handle) => self.control.pid(handle).await,
                    None => None,
                };
                (pid, inner.healthy, inner.started_at)
            }
            // A transition is in flight
            Err(_) => (None, false, None),
        };

        ServerStatus {
            model: self.descriptor.name.clone(),
            port: self.descriptor.port,
            state: self.state(),
            pid,
            healthy,
            idle_secs: self.idle_for().as_secs(),
            uptime_secs: started_at.map(|t| (chrono::Utc::now() - t).num_seconds()),
            started_at,
            embedding_dimensions: self.embedding_dimensions(),
        }
    }

    /// Stop the server and mark the entry dead for good
    pub(crate) async fn retire(&self) -> ManagerResult<()> {
        let mut inner = self.inner.write().await;
        inner.retired = true;
        self.terminate(&mut inner).await
    }

    /// Retire the entry if it has been idle for at least `idle_timeout`.
    ///
    /// Idleness is re-checked after taking the write lock, so a request that
    /// finished while the lock was contended keeps the server alive.
    pub(crate) async fn retire_if_idle(
        &self,
        idle_timeout: Duration,
    ) -> Option<ManagerResult<()>> {
        if self.idle_for() < idle_timeout {
            return None;
        }

        let mut inner = self.inner.write().await;
        if inner.retired || self.idle_for() < idle_timeout {
            return None;
        }

        tracing::info!(
            model = %self.descriptor.name,
            idle_secs = self.idle_for().as_secs(),
            "Stopping idle llama-server"
        );

        inner.retired = true;
        Some(self.terminate(&mut inner).await)
    }

    // ------------------------------------------------------------------------
    // Internals; callers hold the write lock
    // ------------------------------------------------------------------------

    fn set_state(&self, inner: &mut Inner, state: ProcessState) {
        inner.state = state;
        self.phase.store(state.as_u8(), Ordering::SeqCst);
    }

    async fn is_live(&self, inner: &Inner) -> bool {
        match &inner.handle {
            Some(handle) => inner.healthy && self.control.is_alive(handle).await,
            None => false,
        }
    }

    /// Read guard over a running server, starting it under the write lock
    /// when needed
    async fn ensure_running(&self) -> ManagerResult<RwLockReadGuard<'_, Inner>> {
        {
            let inner = self.inner.read().await;
            if inner.retired {
                return Err(self.evicted());
            }
            if self.is_live(&inner).await {
                return Ok(inner);
            }
        }

        let mut inner = self.inner.write().await;
        self.start_locked(&mut inner).await?;
        Ok(inner.downgrade())
    }

    fn evicted(&self) -> ManagerError {
        ManagerError::Evicted {
            model: self.descriptor.name.clone(),
        }
    }

    async fn start_locked(&self, inner: &mut Inner) -> ManagerResult<()> {
        if inner.retired {
            return Err(self.evicted());
        }

        if inner.stopping.is_some() {
            // A stop whose caller went away is still running
            if let Err(e) = self.finish_stop(inner).await {
                tracing::warn!(model = %self.descriptor.name, error = %e, "Interrupted stop reported an error");
            }
        }

        if let Some(handle) = inner.handle.clone() {
            if self.control.is_alive(&handle).await {
                if inner.healthy {
                    return Ok(());
                }
                // Alive but not answering; probe again instead of spawning twice
                tracing::info!(model = %self.descriptor.name, "Re-probing unhealthy llama-server");
                return self.await_healthy(inner, handle).await;
            }

            tracing::warn!(
                model = %self.descriptor.name,
                "llama-server exited unexpectedly, restarting"
            );
            self.control.release(handle).await;
            self.reset(inner);
        }

        let handle = match self.control.spawn(self.spawn_config()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    model = %self.descriptor.name,
                    error = %e,
                    "Failed to spawn llama-server"
                );
                crate::metrics::record_startup_failure(&self.descriptor.name);
                return Err(ManagerError::StartupFailed {
                    model: self.descriptor.name.clone(),
                    reason: format!("{:#}", e),
                });
            }
        };

        let pid = self.control.pid(&handle).await;
        inner.handle = Some(handle.clone());
        inner.started_at = Some(chrono::Utc::now());

        tracing::info!(
            model = %self.descriptor.name,
            port = self.descriptor.port,
            pid = ?pid,
            "llama-server spawned, waiting for health"
        );

        self.await_healthy(inner, handle).await
    }

    /// Poll `/health` until it passes, the process exits or the startup
    /// timeout elapses
    async fn await_healthy(&self, inner: &mut Inner, handle: ProcessHandle) -> ManagerResult<()> {
        self.set_state(inner, ProcessState::Starting);
        inner.healthy = false;

        let started = tokio::time::Instant::now();
        let deadline = started + self.settings.startup_timeout;

        loop {
            // No probe may run past the startup deadline
            let probe_timeout = self
                .settings
                .health_probe_timeout
                .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
            let probe = tokio::time::timeout_at(
                deadline,
                self.backend.health(self.descriptor.port, probe_timeout),
            )
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("health probe hit the startup deadline")));

            match probe {
                Ok(true) => {
                    inner.healthy = true;
                    self.set_state(inner, ProcessState::Running);
                    self.touch();
                    crate::metrics::record_server_started(&self.descriptor.name);

                    tracing::info!(
                        model = %self.descriptor.name,
                        port = self.descriptor.port,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "llama-server is healthy"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    tracing::debug!(model = %self.descriptor.name, "llama-server still loading");
                }
                Err(e) => {
                    tracing::debug!(model = %self.descriptor.name, error = %e, "Health probe failed");
                }
            }

            if !self.control.is_alive(&handle).await {
                tracing::error!(
                    model = %self.descriptor.name,
                    "llama-server exited during startup"
                );
                self.control.release(handle).await;
                inner.handle = None;
                self.reset(inner);
                crate::metrics::record_startup_failure(&self.descriptor.name);
                return Err(ManagerError::StartupFailed {
                    model: self.descriptor.name.clone(),
                    reason: "process exited before becoming healthy".to_string(),
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::error!(
                    model = %self.descriptor.name,
                    timeout_ms = self.settings.startup_timeout.as_millis() as u64,
                    "llama-server did not become healthy, terminating"
                );
                if let Err(e) = self.terminate(inner).await {
                    tracing::warn!(model = %self.descriptor.name, error = %e, "Cleanup after startup timeout failed");
                }
                crate::metrics::record_startup_failure(&self.descriptor.name);
                return Err(ManagerError::StartupTimeout {
                    model: self.descriptor.name.clone(),
                    timeout: self.settings.startup_timeout,
                });
            }

            tokio::time::sleep(self.settings.health_poll_interval.min(deadline - now)).await;
        }
    }

    fn reset(&self, inner: &mut Inner) {
        inner.healthy = false;
        inner.started_at = None;
        self.set_state(inner, ProcessState::Stopped);
    }

    async fn terminate(&self, inner: &mut Inner) -> ManagerResult<()> {
        if inner.stopping.is_none() {
            let Some(handle) = inner.handle.clone() else {
                self.reset(inner);
                return Ok(());
            };

            inner.healthy = false;
            self.set_state(inner, ProcessState::Stopping);
            inner.stopping = Some(tokio::spawn(stop_process(
                self.control.clone(),
                handle,
                self.descriptor.name.clone(),
                self.settings.stop_grace,
            )));
        }

        self.finish_stop(inner).await
    }

    /// Wait for the in-flight stop, then clear the handle
    async fn finish_stop(&self, inner: &mut Inner) -> ManagerResult<()> {
        let Some(task) = inner.stopping.as_mut() else {
            return Ok(());
        };

        let result = task.await.unwrap_or_else(|e| {
            Err(ManagerError::ShutdownError {
                model: self.descriptor.name.clone(),
                reason: format!("stop task failed: {}", e),
            })
        });

        inner.stopping = None;
        inner.handle = None;
        self.reset(inner);

        crate::metrics::record_server_stopped(&self.descriptor.name);

        match &result {
            Ok(()) => tracing::info!(model = %self.descriptor.name, "llama-server stopped"),
            Err(e) => tracing::warn!(model = %self.descriptor.name, error = %e, "llama-server stop reported an error"),
        }

        result
    }
}

/// SIGTERM, grace period, SIGKILL, then release the handle.
///
/// Spawned as its own task: dropping the caller that started it does not
/// abort the sequence.
async fn stop_process(
    control: Arc<dyn ProcessControl>,
    handle: ProcessHandle,
    model: String,
    grace: Duration,
) -> ManagerResult<()> {
    let result = signal_and_wait(control.as_ref(), &handle, &model, grace).await;
    control.release(handle).await;
    result
}

async fn signal_and_wait(
    control: &dyn ProcessControl,
    handle: &ProcessHandle,
    model: &str,
    grace: Duration,
) -> ManagerResult<()> {
    let shutdown_error = |reason: String| ManagerError::ShutdownError {
        model: model.to_string(),
        reason,
    };

    control
        .signal(handle, StopSignal::Terminate)
        .await
        .map_err(|e| shutdown_error(format!("{:#}", e)))?;

    match control.wait(handle, grace).await {
        Ok(true) => return Ok(()),
        Ok(false) => {
            tracing::warn!(
                model = %model,
                grace_ms = grace.as_millis() as u64,
                "Graceful shutdown timeout, sending SIGKILL"
            );
        }
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "Failed waiting for exit, sending SIGKILL");
        }
    }

    control
        .signal(handle, StopSignal::Kill)
        .await
        .map_err(|e| shutdown_error(format!("{:#}", e)))?;

    match control.wait(handle, KILL_WAIT).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(shutdown_error(
            "process still alive after SIGKILL".to_string(),
        )),
        Err(e) => Err(shutdown_error(format!("{:#}", e))),
    }
}
