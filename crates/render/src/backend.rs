//! What the queue executes render commands against.

use async_trait::async_trait;
use molview_worker::transport::CommandOutput;
use molview_worker::{WorkerManagerError, WorkerProcessManager};

/// Command execution seam between the queue and the worker pool.
///
/// Implemented by [`WorkerProcessManager`]; tests substitute a fake that
/// writes image files directly.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn send_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, WorkerManagerError>;
}

#[async_trait]
impl RenderBackend for WorkerProcessManager {
    async fn send_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, WorkerManagerError> {
        WorkerProcessManager::send_command(self, session_id, command).await
    }
}
