use molview_core::error::CoreError;
use molview_core::types::JobId;

/// Errors surfaced by the render queue.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Every attempt and the placeholder failed. Indicates a bug or a
    /// broken output directory.
    #[error("Rendering exhausted for job {job_id}: {reason}")]
    RenderingExhausted { job_id: JobId, reason: String },

    /// The request could not be turned into render parameters.
    #[error("Invalid render request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreError> for RenderError {
    fn from(err: CoreError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
