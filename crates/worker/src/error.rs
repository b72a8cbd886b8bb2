use crate::transport::TransportError;

/// Errors returned by [`WorkerProcessManager`](crate::manager::WorkerProcessManager).
///
/// Spawn-time variants are fatal to that call; nothing is retried
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum WorkerManagerError {
    /// Every worker slot is taken.
    #[error("No worker slot available (limit is {max_instances} instances)")]
    ResourceExhausted { max_instances: usize },

    /// Every port in the pool is leased or externally occupied.
    #[error("No free port available for a new worker")]
    NoPortAvailable,

    /// The command endpoint never answered within the polling budget.
    #[error("Worker for session {session_id} did not become ready after {attempts} probes")]
    StartupTimeout { session_id: String, attempts: u32 },

    /// The process exited while we were waiting for it to become ready.
    #[error("Worker for session {session_id} exited during startup")]
    ProcessExitedEarly { session_id: String },

    /// The engine executable could not be started.
    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    /// No worker is registered for the session.
    #[error("No worker for session {0}")]
    SessionNotFound(String),

    /// A worker is already registered (or starting) for the session.
    #[error("A worker for session {0} already exists")]
    SessionAlreadyExists(String),

    /// The worker is registered but has not finished starting.
    #[error("Worker for session {0} is still starting")]
    WorkerNotReady(String),

    /// The command channel failed (I/O, timeout, closed channel).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The worker ran the command and reported a failure.
    #[error("Worker reported an error: {0}")]
    WorkerError(String),
}

impl From<TransportError> for WorkerManagerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Engine(message) => Self::WorkerError(message),
            other => Self::TransportError(other.to_string()),
        }
    }
}
