//! Render job records.

use std::path::PathBuf;

use molview_core::error::CoreError;
use molview_core::render::RenderParameters;
use molview_core::scheduling::JobStatus;
use molview_core::types::{JobId, SessionId, Timestamp};
use serde::Serialize;

/// One requested image and its progress.
#[derive(Debug, Clone, Serialize)]
pub struct RenderJob {
    pub id: JobId,
    pub session_id: SessionId,
    pub parameters: RenderParameters,
    /// Higher runs sooner.
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    /// Fallback/placeholder note on success, error text on failure.
    pub message: Option<String>,
}

impl RenderJob {
    pub fn new(session_id: &str, parameters: RenderParameters, priority: i32) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            session_id: session_id.to_string(),
            parameters,
            priority,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            file_path: None,
            file_size: None,
            message: None,
        }
    }

    /// Move to `to`, stamping `updated_at` (and `completed_at` for
    /// terminal states).
    pub fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        self.status.validate_transition(to)?;
        let now = chrono::Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
