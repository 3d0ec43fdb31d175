//! Background eviction of idle llama-servers

use crate::manager::ServerManager;
use std::sync::Weak;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Periodically asks the manager to stop servers that have sat idle.
///
/// Holds only a weak reference so the manager can be dropped while the task
/// is parked; the loop ends on cancellation or once the manager is gone.
pub struct IdleSweeper {
    manager: Weak<ServerManager>,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

impl IdleSweeper {
    pub fn new(
        manager: Weak<ServerManager>,
        sweep_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manager,
            sweep_interval,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Sweep loop
    pub async fn run(self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Idle sweep started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Idle sweep cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(manager) = self.manager.upgrade() else {
                        tracing::debug!("Server manager dropped, ending idle sweep");
                        break;
                    };

                    let evicted = manager.sweep_idle().await;
                    if !evicted.is_empty() {
                        tracing::debug!(count = evicted.len(), "Sweep cycle evicted servers");
                    }
                }
            }
        }
    }
}
