//! Lifecycle events published by the worker manager.

use serde::Serialize;

/// A worker lifecycle change.
#[derive(Debug, Clone, Serialize)]
pub enum WorkerEvent {
    /// The worker answered its readiness probe and no-op command.
    Ready {
        session_id: String,
        port: u16,
        pid: u32,
    },

    /// A spawn attempt failed and its registration was discarded.
    StartupFailed { session_id: String, error: String },

    /// The worker was removed from the registry and its port released.
    Terminated {
        session_id: String,
        port: u16,
        reason: TerminationReason,
    },
}

/// Why a worker was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Explicit `terminate` call.
    Requested,
    /// No commands for longer than the idle timeout.
    Idle,
    /// The command endpoint stopped answering health probes.
    Unreachable,
    /// The OS process was found dead.
    ProcessDied,
    /// Manager shutdown.
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Idle => "idle",
            Self::Unreachable => "unreachable",
            Self::ProcessDied => "process_died",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
