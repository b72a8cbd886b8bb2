use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use molview_core::render::{CameraSettings, RenderRequest};
use molview_core::scheduling::JobStatus;
use molview_core::types::JobId;
use molview_render::backend::RenderBackend;
use molview_render::config::QueueConfig;
use molview_render::events::RenderEvent;
use molview_render::{RenderError, RenderQueue};
use molview_worker::transport::CommandOutput;
use molview_worker::WorkerManagerError;
use tokio::sync::{broadcast, Semaphore};

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Mode {
    /// Write a valid image file.
    Succeed,
    /// Every command fails.
    FailAll,
    /// The first N commands write a truncated file.
    TruncateFirst(usize),
}

/// Writes the file named in the `save` directive, like a worker would.
struct FakeBackend {
    mode: Mode,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    executed: Mutex<Vec<JobId>>,
    in_flight: Mutex<(usize, HashMap<String, usize>)>,
    max_global: AtomicUsize,
    max_per_session: AtomicUsize,
}

impl FakeBackend {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            gate: None,
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            in_flight: Mutex::new((0, HashMap::new())),
            max_global: AtomicUsize::new(0),
            max_per_session: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn executed(&self) -> Vec<JobId> {
        self.executed.lock().unwrap().clone()
    }

    fn enter(&self, session_id: &str) {
        let mut guard = self.in_flight.lock().unwrap();
        guard.0 += 1;
        let global = guard.0;
        let per_session = guard.1.entry(session_id.to_string()).or_insert(0);
        *per_session += 1;
        let per_session = *per_session;
        self.max_global.fetch_max(global, Ordering::SeqCst);
        self.max_per_session.fetch_max(per_session, Ordering::SeqCst);
    }

    fn leave(&self, session_id: &str) {
        let mut guard = self.in_flight.lock().unwrap();
        guard.0 -= 1;
        if let Some(count) = guard.1.get_mut(session_id) {
            *count -= 1;
        }
    }
}

fn save_path(command: &str) -> PathBuf {
    let start = command.find("save \"").expect("save directive") + "save \"".len();
    let end = start + command[start..].find('"').expect("closing quote");
    PathBuf::from(&command[start..end])
}

#[async_trait]
impl RenderBackend for FakeBackend {
    async fn send_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, WorkerManagerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let path = save_path(command);
        let job_id: JobId = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .expect("job id file name");

        self.enter(session_id);
        self.executed.lock().unwrap().push(job_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.leave(session_id);

        match self.mode {
            Mode::FailAll => Err(WorkerManagerError::WorkerError("engine crashed".into())),
            Mode::TruncateFirst(n) if call < n => {
                std::fs::write(&path, b"short").unwrap();
                Ok(CommandOutput::default())
            }
            _ => {
                std::fs::write(&path, vec![0u8; 4096]).unwrap();
                Ok(CommandOutput::default())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(output_dir: PathBuf, max_concurrent_jobs: usize) -> QueueConfig {
    QueueConfig {
        output_dir,
        max_concurrent_jobs,
        retry_delay: Duration::from_millis(1),
        placeholder_width: 200,
        placeholder_height: 150,
        ..QueueConfig::default()
    }
}

fn queue_with(
    backend: FakeBackend,
    max_concurrent_jobs: usize,
) -> (Arc<RenderQueue>, Arc<FakeBackend>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(backend);
    let queue = RenderQueue::new(
        config(dir.path().to_path_buf(), max_concurrent_jobs),
        Arc::clone(&backend) as Arc<dyn RenderBackend>,
    );
    (queue, backend, dir)
}

/// Collect `n` terminal (completed or failed) events.
async fn wait_finished(events: &mut broadcast::Receiver<RenderEvent>, n: usize) -> Vec<RenderEvent> {
    let mut finished = Vec::new();
    while finished.len() < n {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for render events")
            .unwrap();
        if matches!(event, RenderEvent::Completed { .. } | RenderEvent::Failed { .. }) {
            finished.push(event);
        }
    }
    finished
}

async fn wait_started(events: &mut broadcast::Receiver<RenderEvent>, job_id: JobId) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for job start")
            .unwrap();
        if matches!(event, RenderEvent::Started { job_id: id, .. } if id == job_id) {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_runs_first_then_fifo() {
    let (queue, backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 3);
    let mut events = queue.subscribe();

    let job1 = queue.submit_with_priority("s", RenderRequest::default(), 1).await.unwrap();
    let job2 = queue.submit_with_priority("s", RenderRequest::default(), 1).await.unwrap();
    let job3 = queue.submit_with_priority("s", RenderRequest::default(), 5).await.unwrap();

    queue.start();
    wait_finished(&mut events, 3).await;

    assert_eq!(backend.executed(), vec![job3.id, job1.id, job2.id]);
}

#[tokio::test]
async fn equal_priority_runs_in_submission_order() {
    let (queue, backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);
    let mut events = queue.subscribe();

    let mut submitted = Vec::new();
    for i in 0..5 {
        let job = queue
            .submit(&format!("s{i}"), RenderRequest::default())
            .await
            .unwrap();
        submitted.push(job.id);
    }

    queue.start();
    wait_finished(&mut events, 5).await;

    assert_eq!(backend.executed(), submitted);
}

// ---------------------------------------------------------------------------
// Concurrency limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn respects_global_and_per_session_limits() {
    let backend = FakeBackend::new(Mode::Succeed).with_delay(Duration::from_millis(20));
    let (queue, backend, _dir) = queue_with(backend, 2);
    let mut events = queue.subscribe();
    queue.start();

    for session in ["a", "a", "b", "b", "c", "c"] {
        queue.submit(session, RenderRequest::default()).await.unwrap();
    }
    wait_finished(&mut events, 6).await;

    assert_eq!(backend.max_global.load(Ordering::SeqCst), 2);
    assert_eq!(backend.max_per_session.load(Ordering::SeqCst), 1);
    assert_eq!(queue.stats().await.completed, 6);
}

#[tokio::test]
async fn busy_session_does_not_block_other_sessions() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = FakeBackend::new(Mode::Succeed).with_gate(Arc::clone(&gate));
    let (queue, backend, _dir) = queue_with(backend, 2);
    let mut events = queue.subscribe();
    queue.start();

    let first = queue.submit("busy", RenderRequest::default()).await.unwrap();
    wait_started(&mut events, first.id).await;

    let blocked = queue.submit("busy", RenderRequest::default()).await.unwrap();
    let other = queue.submit("other", RenderRequest::default()).await.unwrap();
    wait_started(&mut events, other.id).await;

    assert_eq!(queue.get_job(blocked.id).await.unwrap().status, JobStatus::Pending);

    gate.add_permits(3);
    wait_finished(&mut events, 3).await;
    assert_eq!(backend.executed().len(), 3);
}

// ---------------------------------------------------------------------------
// Retry, fallback, placeholder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_render_records_file() {
    let (queue, _backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);
    let mut events = queue.subscribe();
    queue.start();

    let job = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_finished(&mut events, 1).await;

    let job = queue.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.file_size, Some(4096));
    assert!(job.message.is_none());
    assert!(job.completed_at.is_some());
    assert!(job.file_path.unwrap().exists());
}

#[tokio::test]
async fn truncated_output_retries_with_fallback() {
    let (queue, backend, _dir) = queue_with(FakeBackend::new(Mode::TruncateFirst(1)), 1);
    let mut events = queue.subscribe();
    queue.start();

    let job = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_finished(&mut events, 1).await;

    let job = queue.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert!(job.message.unwrap().contains("fallback"));
}

#[tokio::test]
async fn always_failing_render_completes_with_placeholder() {
    let (queue, backend, _dir) = queue_with(FakeBackend::new(Mode::FailAll), 1);
    let mut events = queue.subscribe();
    queue.start();

    let job = queue.submit("s", RenderRequest::default()).await.unwrap();
    let finished = wait_finished(&mut events, 1).await;
    assert_matches!(finished[0], RenderEvent::Completed { .. });

    let job = queue.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let path = job.file_path.unwrap();
    let size = std::fs::metadata(&path).unwrap().len();
    assert!(size >= 1024);
    assert_eq!(job.file_size, Some(size));
    assert!(job.message.unwrap().starts_with("Placeholder image used"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_pending_job_never_runs() {
    let (queue, backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);
    let mut events = queue.subscribe();

    let doomed = queue.submit("s", RenderRequest::default()).await.unwrap();
    let kept = queue.submit("s", RenderRequest::default()).await.unwrap();
    assert!(queue.cancel(doomed.id).await);
    assert!(!queue.cancel(doomed.id).await);
    assert_eq!(queue.pending_job_ids().await, vec![kept.id]);

    queue.start();
    wait_finished(&mut events, 1).await;

    assert_eq!(backend.executed(), vec![kept.id]);
    assert_eq!(queue.get_job(doomed.id).await.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancelled_processing_job_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let backend = FakeBackend::new(Mode::Succeed).with_gate(Arc::clone(&gate));
    let (queue, _backend, dir) = queue_with(backend, 1);
    let mut events = queue.subscribe();
    queue.start();

    let running = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_started(&mut events, running.id).await;
    assert!(queue.cancel(running.id).await);

    // Same session, so it only starts after the cancelled job has finished.
    let next = queue.submit("s", RenderRequest::default()).await.unwrap();
    gate.add_permits(2);
    let finished = wait_finished(&mut events, 1).await;
    assert_eq!(finished[0].job_id(), next.id);

    let cancelled = queue.get_job(running.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.file_path.is_none());
    let stray = dir.path().join("s").join(format!("{}.png", running.id));
    assert!(!stray.exists());
}

#[tokio::test]
async fn cancel_unknown_or_finished_job_returns_false() {
    let (queue, _backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);
    let mut events = queue.subscribe();
    queue.start();

    assert!(!queue.cancel(uuid::Uuid::new_v4()).await);

    let job = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_finished(&mut events, 1).await;
    assert!(!queue.cancel(job.id).await);
}

// ---------------------------------------------------------------------------
// Submission and cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_clamps_size_and_rejects_bad_requests() {
    let (queue, _backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);

    let job = queue
        .submit(
            "s",
            RenderRequest {
                width: Some(10_000),
                height: Some(300),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!((job.parameters.width, job.parameters.height), (2000, 300));
    assert_eq!(job.priority, 1);

    let err = queue
        .submit(
            "s",
            RenderRequest {
                camera: Some(CameraSettings {
                    zoom: Some(-1.0),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, RenderError::InvalidRequest(_));

    assert_matches!(
        queue.submit("  ", RenderRequest::default()).await,
        Err(RenderError::InvalidRequest(_))
    );
}

#[tokio::test]
async fn cleanup_removes_only_finished_jobs_of_the_session() {
    let (queue, _backend, dir) = queue_with(FakeBackend::new(Mode::Succeed), 2);
    let mut events = queue.subscribe();
    queue.start();

    queue.submit("s1", RenderRequest::default()).await.unwrap();
    queue.submit("s1", RenderRequest::default()).await.unwrap();
    let other = queue.submit("s2", RenderRequest::default()).await.unwrap();
    wait_finished(&mut events, 3).await;

    assert_eq!(queue.cleanup_session_jobs("s1").await, 2);
    assert!(queue.get_session_jobs("s1").await.is_empty());
    assert!(!dir.path().join("s1").exists());

    let other = queue.get_job(other.id).await.unwrap();
    assert!(other.file_path.unwrap().exists());
    assert_eq!(queue.cleanup_session_jobs("s1").await, 0);
}

#[tokio::test]
async fn cleanup_leaves_pending_jobs() {
    let (queue, _backend, _dir) = queue_with(FakeBackend::new(Mode::Succeed), 1);

    let job = queue.submit("s", RenderRequest::default()).await.unwrap();
    assert_eq!(queue.cleanup_session_jobs("s").await, 0);
    assert_eq!(queue.get_job(job.id).await.unwrap().status, JobStatus::Pending);
    assert_eq!(queue.stats().await.pending, 1);
}

#[tokio::test]
async fn cleanup_during_running_job_keeps_its_output_dir() {
    let gate = Arc::new(Semaphore::new(1));
    let backend = FakeBackend::new(Mode::Succeed).with_gate(Arc::clone(&gate));
    let (queue, _backend, dir) = queue_with(backend, 1);
    let mut events = queue.subscribe();
    queue.start();

    let first = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_finished(&mut events, 1).await;

    let running = queue.submit("s", RenderRequest::default()).await.unwrap();
    wait_started(&mut events, running.id).await;

    assert_eq!(queue.cleanup_session_jobs("s").await, 1);
    assert!(queue.get_job(first.id).await.is_none());
    assert!(dir.path().join("s").exists());

    gate.add_permits(1);
    wait_finished(&mut events, 1).await;

    let running = queue.get_job(running.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Completed);
    assert!(running.message.is_none());
    assert!(running.file_path.unwrap().exists());

    assert_eq!(queue.cleanup_session_jobs("s").await, 1);
    assert!(!dir.path().join("s").exists());
}
