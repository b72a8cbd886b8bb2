//! Job lifecycle events published by the render queue.

use std::path::PathBuf;

use molview_core::types::JobId;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum RenderEvent {
    /// The job entered the pending queue.
    Queued {
        job_id: JobId,
        session_id: String,
        priority: i32,
    },

    /// The job was dequeued and marked `Processing`.
    Started { job_id: JobId, session_id: String },

    /// One render attempt failed; the next strategy follows.
    AttemptFailed {
        job_id: JobId,
        attempt: u32,
        error: String,
    },

    Completed {
        job_id: JobId,
        file_path: PathBuf,
        file_size: u64,
        /// Set when a fallback or the placeholder produced the file.
        message: Option<String>,
    },

    Failed { job_id: JobId, error: String },

    Cancelled { job_id: JobId },
}

impl RenderEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::AttemptFailed { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }
}
