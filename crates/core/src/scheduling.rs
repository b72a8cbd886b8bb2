//! Render job status state machine and priority ordering.
//!
//! Lives in `core` so the queue's bookkeeping rules can be tested without
//! spawning tasks or touching the filesystem.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, SessionId};

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority assigned when the caller does not specify one.
pub const DEFAULT_PRIORITY: i32 = 1;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle of a render job.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed, Failed,
/// Cancelled}`, plus `Pending -> Cancelled`. Nothing ever returns to
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses reachable from `self`.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a transition, naming both ends on failure.
    pub fn validate_transition(self, to: JobStatus) -> Result<(), CoreError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pending queue
// ---------------------------------------------------------------------------

/// One waiting job: just enough to order and filter it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub priority: i32,
}

/// Descending-priority, FIFO-within-priority queue of pending jobs.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<QueuedJob>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first entry with strictly lower priority.
    ///
    /// Entries with equal or higher priority stay ahead, so equal
    /// priorities keep arrival order.
    pub fn push(&mut self, job: QueuedJob) {
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority < job.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, job);
    }

    /// Remove a job by id. Returns `true` if it was queued.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.entries.iter().position(|queued| queued.job_id == job_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Dequeue up to `limit` jobs in queue order, skipping any whose
    /// session is in `busy_sessions`.
    ///
    /// Skipped jobs keep their position. At most one job per session is
    /// taken per call, and each taken session is added to
    /// `busy_sessions`.
    pub fn take_ready(
        &mut self,
        limit: usize,
        busy_sessions: &mut HashSet<SessionId>,
    ) -> Vec<QueuedJob> {
        let mut taken = Vec::new();
        let mut index = 0;

        while taken.len() < limit && index < self.entries.len() {
            if busy_sessions.contains(&self.entries[index].session_id) {
                index += 1;
                continue;
            }
            if let Some(job) = self.entries.remove(index) {
                busy_sessions.insert(job.session_id.clone());
                taken.push(job);
            }
        }

        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued job ids in dequeue order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries.iter().map(|queued| queued.job_id).collect()
    }
}
