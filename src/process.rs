//! OS process control for llama-server subprocesses

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How often `wait` re-checks a child for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fallback when the configured log directory cannot be created
const FALLBACK_LOG_DIR: &str = "/tmp/llama-embed-manager/logs";

// ============================================================================
// Trait Definitions
// ============================================================================

/// Everything needed to launch one subprocess
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    /// Used for the log file name and log fields
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// stdout/stderr are appended to `<log_dir>/<name>.log`; discarded when unset
    pub log_dir: Option<PathBuf>,
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: String,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Signals the supervisor sends when stopping a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful (SIGTERM)
    Terminate,
    /// Forceful (SIGKILL)
    Kill,
}

/// Process lifecycle primitives. Signals are delivered to the whole process
/// group so worker threads and helper processes go down with the server.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn a new process in its own process group
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle>;

    /// Deliver a signal to the process group
    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()>;

    /// Wait up to `timeout` for the process to exit; `Ok(true)` once it has
    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<bool>;

    /// Check whether the process is still running
    async fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;

    /// Drop all bookkeeping for the handle, killing the process if it is still up
    async fn release(&self, handle: ProcessHandle);
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process control using tokio::process and nix signals
pub struct SystemProcessControl {
    processes: DashMap<String, Arc<Mutex<Child>>>,
}

impl SystemProcessControl {
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
        }
    }

    fn child(&self, handle: &ProcessHandle) -> Option<Arc<Mutex<Child>>> {
        self.processes.get(&handle.id).map(|entry| entry.value().clone())
    }

    fn open_log_file(log_dir: &Path, name: &str) -> Result<std::fs::File> {
        let log_dir = if let Err(e) = std::fs::create_dir_all(log_dir) {
            tracing::warn!(
                error = %e,
                attempted_dir = %log_dir.display(),
                "Failed to create log directory, falling back to {}",
                FALLBACK_LOG_DIR
            );
            let fallback = Path::new(FALLBACK_LOG_DIR);
            std::fs::create_dir_all(fallback).context("Failed to create fallback log directory")?;
            fallback
        } else {
            log_dir
        };

        let log_path = log_dir.join(format!("{}.log", name));
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))
    }
}

impl Default for SystemProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for SystemProcessControl {
    async fn spawn(&self, config: SpawnConfig) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        match &config.log_dir {
            Some(log_dir) => {
                let log_file = Self::open_log_file(log_dir, &config.name)?;
                let stdout_file = log_file
                    .try_clone()
                    .context("Failed to clone log file for stdout")?;
                cmd.stdout(stdout_file).stderr(log_file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", config.program.display()))?;

        let pid = child.id().context("Failed to get PID")?;
        let handle = ProcessHandle::new(format!("process_{}", pid));

        tracing::info!(
            name = %config.name,
            program = %config.program.display(),
            pid = pid,
            "Process spawned"
        );

        self.processes
            .insert(handle.id.clone(), Arc::new(Mutex::new(child)));

        Ok(handle)
    }

    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()> {
        let Some(child) = self.child(handle) else {
            return Ok(());
        };
        let mut child = child.lock().await;

        // Already reaped
        let Some(pid) = child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let sig = match signal {
                StopSignal::Terminate => Signal::SIGTERM,
                StopSignal::Kill => Signal::SIGKILL,
            };

            match killpg(Pid::from_raw(pid as i32), sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to send {:?} to process group {}", sig, pid)
                    });
                }
            }

            if signal == StopSignal::Kill {
                // Covers the case where the child left its group
                let _ = child.start_kill();
            }
        }

        #[cfg(not(unix))]
        {
            // No graceful signal available; terminate directly
            let _ = signal;
            child.start_kill().context("Failed to kill process")?;
        }

        Ok(())
    }

    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<bool> {
        let Some(child) = self.child(handle) else {
            return Ok(true);
        };

        let poll = async {
            loop {
                {
                    let mut child = child.lock().await;
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            tracing::debug!(handle = %handle.id, status = %status, "Process exited");
                            return Ok(true);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            return Err(anyhow::Error::new(e).context("Failed to poll process"));
                        }
                    }
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let Some(child) = self.child(handle) else {
            return false;
        };
        let mut child = child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let child = self.child(handle)?;
        let child = child.lock().await;
        child.id()
    }

    async fn release(&self, handle: ProcessHandle) {
        if let Some((_, child)) = self.processes.remove(&handle.id) {
            let mut child = child.lock().await;
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(handle = %handle.id, "Releasing live process, killing it");
                let _ = child.start_kill();
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
