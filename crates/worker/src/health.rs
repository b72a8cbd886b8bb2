//! Periodic worker health checks.
//!
//! Follows the same pattern as the other background loops: a
//! `tokio::time::interval` raced against a `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use molview_core::types::SessionId;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::manager::WorkerProcessManager;

/// Sessions reclaimed by one health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// OS process was no longer running.
    pub dead: Vec<SessionId>,
    /// Command endpoint did not answer its probe.
    pub unreachable: Vec<SessionId>,
    /// Idle for longer than the idle timeout.
    pub idle: Vec<SessionId>,
}

impl HealthReport {
    pub fn is_empty(&self) -> bool {
        self.dead.is_empty() && self.unreachable.is_empty() && self.idle.is_empty()
    }

    pub fn total(&self) -> usize {
        self.dead.len() + self.unreachable.len() + self.idle.len()
    }
}

/// Run [`WorkerProcessManager::check_health`] every `interval` until
/// `cancel` fires. The first pass runs one interval after startup.
pub async fn run(manager: Arc<WorkerProcessManager>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Worker health loop started");

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Worker health loop stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = manager.check_health().await;
                let active = manager.active_count().await;
                tracing::debug!(
                    reclaimed = report.total(),
                    active,
                    "Worker health pass complete",
                );
            }
        }
    }
}
