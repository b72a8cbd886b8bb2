//! Worker process records.

use molview_core::types::{SessionId, Timestamp};
use serde::Serialize;

/// Lifecycle of a worker process.
///
/// `Starting -> Ready -> Terminated` normally, `Starting -> Error` when
/// spawning fails. `Terminated` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Error,
    Terminated,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }
}

/// Snapshot of one supervised worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerProcess {
    /// Session the worker belongs to.
    pub id: SessionId,
    pub port: u16,
    /// `None` until the process has been launched.
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub created_at: Timestamp,
    pub last_active: Timestamp,
}

impl WorkerProcess {
    pub(crate) fn starting(id: &str, port: u16) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.to_string(),
            port,
            pid: None,
            status: WorkerStatus::Starting,
            created_at: now,
            last_active: now,
        }
    }

    /// Time since the last command, or zero if the clock went backwards.
    pub fn idle_for(&self, now: Timestamp) -> std::time::Duration {
        (now - self.last_active).to_std().unwrap_or_default()
    }
}
