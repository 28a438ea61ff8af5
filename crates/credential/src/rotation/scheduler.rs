//! Rotation scheduler
//!
//! Drives [`KeyRotationManager::run_due_rotations`] on a fixed tick until
//! shut down. Failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::manager::KeyRotationManager;

/// Periodic driver for scheduled rotations and grace-window purges
#[derive(Debug, Clone)]
pub struct RotationScheduler {
    manager: Arc<KeyRotationManager>,
    interval: Duration,
}

impl RotationScheduler {
    /// Creates a scheduler checking every `interval`
    pub fn new(manager: Arc<KeyRotationManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// A tick in progress finishes before the loop observes cancellation.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::debug!(interval = ?self.interval, "rotation scheduler started");
        loop {
            let next_check = Instant::now() + self.interval;

            tokio::select! {
                _ = sleep_until(next_check) => {
                    let tick = self.manager.run_due_rotations().await;
                    if !tick.failed.is_empty() {
                        tracing::warn!(
                            failed = ?tick.failed,
                            "scheduled rotation failed, will retry next tick"
                        );
                    }
                    if !tick.rotated.is_empty() || !tick.purged.is_empty() {
                        tracing::info!(
                            rotated = ?tick.rotated,
                            purged = ?tick.purged,
                            "scheduled rotation tick completed"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("rotation scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Spawns [`run`](Self::run) onto the current runtime
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
