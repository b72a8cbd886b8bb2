//! Priority render queue with bounded concurrency.
//!
//! Jobs wait in a [`PendingQueue`] ordered by descending priority, FIFO
//! within a priority. A single scheduling loop moves jobs to `Processing`
//! while fewer than `max_concurrent_jobs` are running, never starting a
//! second job for a session that already has one running. Each started
//! job runs on its own task and walks its attempt plan: the requested
//! parameters, degraded fallbacks, and finally a placeholder image.
//!
//! Scheduling passes are triggered through a [`Notify`] on submission and
//! whenever a job finishes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use molview_core::command::build_render_command;
use molview_core::naming::{job_output_path, session_output_dir};
use molview_core::render::{RenderParameters, RenderRequest};
use molview_core::scheduling::{JobStatus, PendingQueue, QueuedJob, DEFAULT_PRIORITY};
use molview_core::types::{JobId, SessionId};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::RenderBackend;
use crate::config::QueueConfig;
use crate::error::RenderError;
use crate::events::RenderEvent;
use crate::job::RenderJob;
use crate::placeholder::{self, PlaceholderSpec};
use crate::strategy::plan_attempts;

/// Broadcast channel capacity for render events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Scheduler-owned bookkeeping. Only mutated under the queue's lock.
#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, RenderJob>,
    pending: PendingQueue,
    /// Jobs started and not yet finished, including cancelled ones whose
    /// command is still in flight.
    processing: HashSet<JobId>,
    /// Sessions with a job in `processing`.
    busy_sessions: HashSet<SessionId>,
}

/// How a job's execution ended.
enum Outcome {
    Rendered {
        path: PathBuf,
        file_size: u64,
        message: Option<String>,
    },
    Cancelled,
    Exhausted(String),
}

/// The rendering job queue.
///
/// Created once at startup with [`RenderQueue::new`]; call
/// [`RenderQueue::start`] to begin processing. Jobs submitted before
/// `start` stay pending until then.
pub struct RenderQueue {
    config: QueueConfig,
    backend: Arc<dyn RenderBackend>,
    state: Mutex<QueueState>,
    wake: Notify,
    event_tx: broadcast::Sender<RenderEvent>,
    cancel: CancellationToken,
}

impl RenderQueue {
    pub fn new(config: QueueConfig, backend: Arc<dyn RenderBackend>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            backend,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn the scheduling loop. Runs until [`RenderQueue::shutdown`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                max_concurrent_jobs = queue.config.max_concurrent_jobs,
                max_attempts = queue.config.max_attempts,
                "Render queue started",
            );
            loop {
                queue.schedule().await;
                tokio::select! {
                    _ = queue.cancel.cancelled() => break,
                    _ = queue.wake.notified() => {}
                }
            }
            tracing::info!("Render queue stopped");
        })
    }

    /// Stop the scheduling loop. Jobs already running finish on their own;
    /// pending jobs stay pending.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ---- submission ----

    /// Queue a render at the default priority.
    pub async fn submit(
        &self,
        session_id: &str,
        request: RenderRequest,
    ) -> Result<RenderJob, RenderError> {
        self.submit_with_priority(session_id, request, DEFAULT_PRIORITY)
            .await
    }

    /// Queue a render. Higher `priority` runs sooner; equal priorities run
    /// in submission order.
    ///
    /// Defaults are applied and the size is clamped to the configured
    /// maxima before the job is created.
    pub async fn submit_with_priority(
        &self,
        session_id: &str,
        request: RenderRequest,
        priority: i32,
    ) -> Result<RenderJob, RenderError> {
        if session_id.trim().is_empty() {
            return Err(RenderError::InvalidRequest(
                "session id must not be empty".to_string(),
            ));
        }
        let parameters = RenderParameters::resolve(request, &self.config.limits)?;
        let job = RenderJob::new(session_id, parameters, priority);

        {
            let mut state = self.state.lock().await;
            state.pending.push(QueuedJob {
                job_id: job.id,
                session_id: job.session_id.clone(),
                priority,
            });
            state.jobs.insert(job.id, job.clone());
        }

        tracing::info!(
            job_id = %job.id,
            session_id,
            priority,
            width = job.parameters.width,
            height = job.parameters.height,
            "Render job queued",
        );
        let _ = self.event_tx.send(RenderEvent::Queued {
            job_id: job.id,
            session_id: job.session_id.clone(),
            priority,
        });

        self.wake.notify_one();
        Ok(job)
    }

    // ---- cancellation and cleanup ----

    /// Cancel a job.
    ///
    /// A pending job is removed from the queue and never runs. A running
    /// job is marked cancelled and its result discarded when the in-flight
    /// command returns. Returns `false` for unknown or finished jobs.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let was_pending = {
            let mut state = self.state.lock().await;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return false;
            };
            if job.transition(JobStatus::Cancelled).is_err() {
                return false;
            }
            state.pending.remove(job_id)
        };

        tracing::info!(job_id = %job_id, was_pending, "Render job cancelled");
        let _ = self.event_tx.send(RenderEvent::Cancelled { job_id });
        true
    }

    /// Delete the records and files of the session's finished jobs.
    ///
    /// Pending and processing jobs are left alone. The session's output
    /// directory is removed once empty and no job of the session remains. Returns the number of purged jobs.
    pub async fn cleanup_session_jobs(&self, session_id: &str) -> usize {
        let purged: Vec<RenderJob> = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| job.session_id == session_id && job.status.is_terminal())
                .map(|job| job.id)
                .collect();
            ids.iter()
                .filter_map(|id| state.jobs.remove(id))
                .collect()
        };

        for job in &purged {
            if let Some(path) = &job.file_path {
                remove_file_quietly(path).await;
            }
        }

        {
            // Under the lock: no job of this session can start meanwhile.
            let state = self.state.lock().await;
            let in_use = state.busy_sessions.contains(session_id)
                || state.jobs.values().any(|job| job.session_id == session_id);
            if !in_use {
                let dir = session_output_dir(&self.config.output_dir, session_id);
                let _ = tokio::fs::remove_dir(&dir).await;
            }
        }

        if !purged.is_empty() {
            tracing::info!(session_id, count = purged.len(), "Session render jobs cleaned up");
        }
        purged.len()
    }

    // ---- introspection ----

    pub async fn get_job(&self, job_id: JobId) -> Option<RenderJob> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    /// All jobs for a session, oldest first.
    pub async fn get_session_jobs(&self, session_id: &str) -> Vec<RenderJob> {
        let mut jobs: Vec<RenderJob> = self
            .state
            .lock()
            .await
            .jobs
            .values()
            .filter(|job| job.session_id == session_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Pending job ids in dequeue order.
    pub async fn pending_job_ids(&self) -> Vec<JobId> {
        self.state.lock().await.pending.job_ids()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    // ---- scheduling ----

    /// One scheduling pass: start as many ready jobs as capacity allows.
    async fn schedule(self: &Arc<Self>) {
        let started: Vec<RenderJob> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let capacity = self
                .config
                .max_concurrent_jobs
                .saturating_sub(state.processing.len());
            if capacity == 0 || state.pending.is_empty() {
                return;
            }

            let ready = state.pending.take_ready(capacity, &mut state.busy_sessions);
            let mut started = Vec::with_capacity(ready.len());
            for queued in ready {
                let Some(job) = state.jobs.get_mut(&queued.job_id) else {
                    state.busy_sessions.remove(&queued.session_id);
                    continue;
                };
                if let Err(e) = job.transition(JobStatus::Processing) {
                    tracing::error!(job_id = %queued.job_id, error = %e, "Cannot start render job");
                    state.busy_sessions.remove(&queued.session_id);
                    continue;
                }
                state.processing.insert(queued.job_id);
                started.push(job.clone());
            }
            started
        };

        for job in started {
            tracing::info!(job_id = %job.id, session_id = %job.session_id, "Render job started");
            let _ = self.event_tx.send(RenderEvent::Started {
                job_id: job.id,
                session_id: job.session_id.clone(),
            });

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = queue.execute(&job).await;
                queue.finish(&job, outcome).await;
                queue.wake.notify_one();
            });
        }
    }

    // ---- execution ----

    /// Walk the job's attempt plan until something produces a valid file.
    async fn execute(&self, job: &RenderJob) -> Outcome {
        let path = job_output_path(
            &self.config.output_dir,
            &job.session_id,
            job.id,
            job.parameters.format,
        );
        let plan = plan_attempts(
            &job.parameters,
            self.config.max_attempts,
            &self.config.fallback_resolutions,
        );
        let mut last_error = String::from("no attempt made");
        let mut attempt: u32 = 0;

        for strategy in &plan {
            if self.is_cancelled(job.id).await {
                return Outcome::Cancelled;
            }

            let Some(params) = strategy.apply(&job.parameters) else {
                return self.render_placeholder(job, &path, attempt, &last_error).await;
            };

            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
            attempt += 1;

            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Outcome::Exhausted(format!("cannot create output directory: {e}"));
                }
            }
            remove_file_quietly(&path).await;
            let command = build_render_command(&params, &path);
            tracing::debug!(job_id = %job.id, attempt, strategy = %strategy.describe(), "Render attempt");

            let error = match self.backend.send_command(&job.session_id, &command).await {
                Ok(_) => match self.verify_output(&path).await {
                    Ok(file_size) => {
                        let message = (attempt > 1)
                            .then(|| format!("Rendered with {} after {last_error}", strategy.describe()));
                        return Outcome::Rendered {
                            path,
                            file_size,
                            message,
                        };
                    }
                    Err(reason) => reason,
                },
                Err(e) => e.to_string(),
            };

            remove_file_quietly(&path).await;
            tracing::warn!(job_id = %job.id, attempt, error = %error, "Render attempt failed");
            let _ = self.event_tx.send(RenderEvent::AttemptFailed {
                job_id: job.id,
                attempt,
                error: error.clone(),
            });
            last_error = error;
        }

        Outcome::Exhausted(last_error)
    }

    async fn render_placeholder(
        &self,
        job: &RenderJob,
        path: &Path,
        attempts: u32,
        last_error: &str,
    ) -> Outcome {
        let reason = format!("{attempts} render attempts failed. Last error: {last_error}");
        let spec = PlaceholderSpec {
            width: self.config.placeholder_width,
            height: self.config.placeholder_height,
            format: job.parameters.format,
            job_id: job.id,
            session_id: &job.session_id,
            reason: &reason,
        };

        match placeholder::write(path, &spec).await {
            Ok(file_size) if file_size >= self.config.min_file_bytes => {
                tracing::warn!(job_id = %job.id, attempts, "Using placeholder image");
                Outcome::Rendered {
                    path: path.to_path_buf(),
                    file_size,
                    message: Some(format!("Placeholder image used: {reason}")),
                }
            }
            Ok(file_size) => {
                remove_file_quietly(path).await;
                Outcome::Exhausted(format!(
                    "placeholder too small ({file_size} bytes); {reason}"
                ))
            }
            Err(e) => Outcome::Exhausted(format!("placeholder failed ({e}); {reason}")),
        }
    }

    /// The file exists and is at least `min_file_bytes` long.
    async fn verify_output(&self, path: &Path) -> Result<u64, String> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() >= self.config.min_file_bytes => Ok(meta.len()),
            Ok(meta) => Err(format!(
                "output file too small ({} bytes, minimum {})",
                meta.len(),
                self.config.min_file_bytes
            )),
            Err(_) => Err("output file missing after render".to_string()),
        }
    }

    async fn is_cancelled(&self, job_id: JobId) -> bool {
        self.state
            .lock()
            .await
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.status == JobStatus::Cancelled)
    }

    /// Record the outcome and free the job's concurrency slots.
    async fn finish(&self, job: &RenderJob, outcome: Outcome) {
        let mut discard: Option<PathBuf> = None;
        let event = {
            let mut state = self.state.lock().await;
            state.processing.remove(&job.id);
            state.busy_sessions.remove(&job.session_id);

            let record = state
                .jobs
                .get_mut(&job.id)
                .filter(|record| record.status == JobStatus::Processing);

            match (record, outcome) {
                (None, Outcome::Rendered { path, .. }) => {
                    // Cancelled while running.
                    discard = Some(path);
                    None
                }
                (None, _) | (Some(_), Outcome::Cancelled) => None,
                (
                    Some(record),
                    Outcome::Rendered {
                        path,
                        file_size,
                        message,
                    },
                ) => {
                    record.file_path = Some(path.clone());
                    record.file_size = Some(file_size);
                    record.message = message.clone();
                    let _ = record.transition(JobStatus::Completed);
                    tracing::info!(job_id = %job.id, file_size, fallback = message.is_some(), "Render job completed");
                    Some(RenderEvent::Completed {
                        job_id: job.id,
                        file_path: path,
                        file_size,
                        message,
                    })
                }
                (Some(record), Outcome::Exhausted(reason)) => {
                    let err = RenderError::RenderingExhausted {
                        job_id: job.id,
                        reason,
                    };
                    record.message = Some(err.to_string());
                    let _ = record.transition(JobStatus::Failed);
                    tracing::error!(job_id = %job.id, error = %err, "Render job failed");
                    Some(RenderEvent::Failed {
                        job_id: job.id,
                        error: err.to_string(),
                    })
                }
            }
        };

        if let Some(path) = discard {
            tracing::info!(job_id = %job.id, "Discarding result of cancelled job");
            remove_file_quietly(&path).await;
        }
        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove render file"),
    }
}
