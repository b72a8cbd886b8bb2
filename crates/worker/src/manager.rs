//! Worker process supervision.
//!
//! [`WorkerProcessManager`] owns every worker process: it leases a port,
//! launches the engine, waits for its command endpoint to become
//! interactive, routes commands through the worker's [`CommandChannel`],
//! and reclaims workers that die, stop answering, or sit idle.
//!
//! Lifecycle events are broadcast via a [`tokio::sync::broadcast`]
//! channel. Call [`WorkerProcessManager::subscribe`] to receive them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use molview_core::types::SessionId;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::CommandChannel;
use crate::config::WorkerConfig;
use crate::error::WorkerManagerError;
use crate::events::{TerminationReason, WorkerEvent};
use crate::health::HealthReport;
use crate::ports::PortAllocator;
use crate::process::{WorkerProcess, WorkerStatus};
use crate::runtime::{OsRuntime, WorkerRuntime};
use crate::transport::{CommandOutput, CommandTransport, RestTransport, EXIT_COMMAND, NOOP_COMMAND};

/// Broadcast channel capacity for worker events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll interval while waiting for a worker to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Multiplier on the probe timeout for the startup no-op command.
const CONFIRM_TIMEOUT_FACTOR: u32 = 5;

/// Supervises the pool of worker processes, one per session.
///
/// Created once at startup; the returned `Arc` is shared with the render
/// queue, the health loop, and request handlers.
pub struct WorkerProcessManager {
    config: WorkerConfig,
    runtime: Arc<dyn WorkerRuntime>,
    transport: Arc<dyn CommandTransport>,
    /// Registered workers (starting or ready) indexed by session.
    workers: RwLock<HashMap<SessionId, ManagedWorker>>,
    /// Always locked after `workers` when both are needed.
    ports: Mutex<PortAllocator>,
    next_instance: AtomicU64,
    event_tx: broadcast::Sender<WorkerEvent>,
    /// Master cancellation token; command channels hold child tokens.
    cancel: CancellationToken,
}

/// Internal bookkeeping for one registered worker.
struct ManagedWorker {
    /// Distinguishes successive workers registered under the same session.
    instance: u64,
    process: WorkerProcess,
    /// Set once the worker is ready.
    channel: Option<CommandChannel>,
}

impl WorkerProcessManager {
    pub fn new(
        config: WorkerConfig,
        runtime: Arc<dyn WorkerRuntime>,
        transport: Arc<dyn CommandTransport>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ports = PortAllocator::new(config.base_port, config.max_instances);

        Arc::new(Self {
            config,
            runtime,
            transport,
            workers: RwLock::new(HashMap::new()),
            ports: Mutex::new(ports),
            next_instance: AtomicU64::new(1),
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Manager that launches real OS processes and talks REST to them.
    pub fn with_os_defaults(config: WorkerConfig) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(OsRuntime::new()),
            Arc::new(RestTransport::new()),
        )
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Subscribe to worker lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    // ---- lifecycle ----

    /// Start a worker for `session_id` and wait until it is interactive.
    ///
    /// Fails without retrying. On any startup failure the process is
    /// killed and its registration and port are released before the
    /// error is returned.
    pub async fn spawn(&self, session_id: &str) -> Result<WorkerProcess, WorkerManagerError> {
        let (instance, port) = self.reserve(session_id).await?;
        tracing::info!(session_id, port, "Spawning worker");

        let spec = self.config.launch_spec(session_id, port);
        let pid = match self.runtime.launch(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                let err = WorkerManagerError::LaunchFailed(e.to_string());
                self.discard_failed_spawn(session_id, instance, port, None, &err).await;
                return Err(err);
            }
        };

        let attached = {
            let mut workers = self.workers.write().await;
            match workers.get_mut(session_id) {
                Some(worker) if worker.instance == instance => {
                    worker.process.pid = Some(pid);
                    true
                }
                _ => false,
            }
        };

        if !attached {
            // Terminated during launch. The record had no pid, so the port
            // is still leased to this spawn.
            tracing::info!(session_id, port, pid, "Worker terminated during launch");
            self.kill_quietly(session_id, pid).await;
            self.ports.lock().await.release(port);
            return Err(WorkerManagerError::SessionNotFound(session_id.to_string()));
        }

        if let Err(err) = self.wait_until_ready(session_id, pid, port).await {
            self.discard_failed_spawn(session_id, instance, port, Some(pid), &err).await;
            return Err(err);
        }

        let channel = CommandChannel::open(
            session_id,
            port,
            Arc::clone(&self.transport),
            self.config.channel_settings(),
            self.cancel.child_token(),
        );

        let registered = {
            let mut workers = self.workers.write().await;
            match workers.get_mut(session_id) {
                Some(worker) if worker.instance == instance => {
                    worker.process.status = WorkerStatus::Ready;
                    worker.process.last_active = chrono::Utc::now();
                    worker.channel = Some(channel.clone());
                    Some(worker.process.clone())
                }
                _ => None,
            }
        };

        let Some(process) = registered else {
            // Terminated while starting; the terminator released the port.
            channel.close();
            self.kill_quietly(session_id, pid).await;
            return Err(WorkerManagerError::SessionNotFound(session_id.to_string()));
        };

        tracing::info!(session_id, port, pid, "Worker ready");
        let _ = self.event_tx.send(WorkerEvent::Ready {
            session_id: session_id.to_string(),
            port,
            pid,
        });

        Ok(process)
    }

    /// Stop the worker for `session_id`.
    ///
    /// Returns `false` if no worker is registered for the session.
    pub async fn terminate(&self, session_id: &str) -> bool {
        self.terminate_with_reason(session_id, TerminationReason::Requested)
            .await
    }

    /// Stop a worker, recording why.
    ///
    /// Asks the worker to exit through its command endpoint, force-kills
    /// it after the grace period, and always releases the port.
    pub async fn terminate_with_reason(&self, session_id: &str, reason: TerminationReason) -> bool {
        match self.unregister(session_id, None).await {
            Some(worker) => {
                self.stop_worker(worker, reason).await;
                true
            }
            None => false,
        }
    }

    /// Terminate every worker and stop all command channels.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker manager");
        self.cancel.cancel();

        let drained: Vec<ManagedWorker> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, worker)| worker).collect()
        };

        futures::future::join_all(
            drained
                .into_iter()
                .map(|worker| self.stop_worker(worker, TerminationReason::Shutdown)),
        )
        .await;

        tracing::info!("Worker manager shut down complete");
    }

    // ---- commands ----

    /// Run one command on the session's worker.
    ///
    /// Safe to call concurrently: commands for the same worker are
    /// serialised by its channel. Updates `last_active` before and after
    /// the command.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, WorkerManagerError> {
        let channel = {
            let mut workers = self.workers.write().await;
            let worker = workers
                .get_mut(session_id)
                .ok_or_else(|| WorkerManagerError::SessionNotFound(session_id.to_string()))?;
            let channel = worker
                .channel
                .clone()
                .ok_or_else(|| WorkerManagerError::WorkerNotReady(session_id.to_string()))?;
            worker.process.last_active = chrono::Utc::now();
            channel
        };

        tracing::debug!(session_id, command, "Sending worker command");
        let result = channel.submit(command).await;
        self.touch(session_id).await;

        result.map_err(|e| {
            tracing::warn!(session_id, error = %e, "Worker command failed");
            WorkerManagerError::from(e)
        })
    }

    // ---- introspection ----

    pub async fn get_worker(&self, session_id: &str) -> Option<WorkerProcess> {
        self.workers
            .read()
            .await
            .get(session_id)
            .map(|worker| worker.process.clone())
    }

    /// Snapshots of all registered workers, oldest first.
    pub async fn list_workers(&self) -> Vec<WorkerProcess> {
        let mut list: Vec<WorkerProcess> = self
            .workers
            .read()
            .await
            .values()
            .map(|worker| worker.process.clone())
            .collect();
        list.sort_by_key(|process| process.created_at);
        list
    }

    /// Registered workers, including those still starting.
    pub async fn active_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn leased_ports(&self) -> Vec<u16> {
        self.ports.lock().await.leased()
    }

    // ---- health ----

    /// Run one health pass over all ready workers.
    ///
    /// Dead processes are removed, workers whose endpoint does not answer
    /// are terminated, then idle workers are cleaned up. Workers with a
    /// command queued or in flight are not probed.
    pub async fn check_health(&self) -> HealthReport {
        let mut report = HealthReport::default();

        for (session_id, instance, pid, port, busy) in self.ready_snapshot().await {
            if let Some(pid) = pid {
                if !self.runtime.is_alive(pid).await {
                    tracing::warn!(session_id = %session_id, pid, "Worker process died");
                    if self
                        .terminate_instance(&session_id, instance, TerminationReason::ProcessDied)
                        .await
                    {
                        report.dead.push(session_id);
                    }
                    continue;
                }
            }

            if busy {
                continue;
            }

            if let Err(e) = self.transport.probe(port, self.config.probe_timeout).await {
                tracing::warn!(session_id = %session_id, port, error = %e, "Worker unreachable");
                if self
                    .terminate_instance(&session_id, instance, TerminationReason::Unreachable)
                    .await
                {
                    report.unreachable.push(session_id);
                }
            }
        }

        report.idle = self.cleanup_idle().await;

        if !report.is_empty() {
            tracing::info!(
                dead = report.dead.len(),
                unreachable = report.unreachable.len(),
                idle = report.idle.len(),
                "Health check reclaimed workers",
            );
        }
        report
    }

    /// Terminate ready workers idle for longer than the idle timeout.
    ///
    /// Returns the sessions whose workers were terminated.
    pub async fn cleanup_idle(&self) -> Vec<SessionId> {
        let now = chrono::Utc::now();
        let idle: Vec<(SessionId, u64)> = {
            let workers = self.workers.read().await;
            workers
                .iter()
                .filter(|(_, worker)| {
                    worker.process.status == WorkerStatus::Ready
                        && worker.channel.as_ref().is_some_and(|c| c.depth() == 0)
                        && worker.process.idle_for(now) > self.config.idle_timeout
                })
                .map(|(session_id, worker)| (session_id.clone(), worker.instance))
                .collect()
        };

        let mut terminated = Vec::new();
        for (session_id, instance) in idle {
            tracing::info!(session_id = %session_id, "Terminating idle worker");
            if self
                .terminate_instance(&session_id, instance, TerminationReason::Idle)
                .await
            {
                terminated.push(session_id);
            }
        }
        terminated
    }

    // ---- private helpers ----

    /// Register a `Starting` record and lease a port for it.
    async fn reserve(&self, session_id: &str) -> Result<(u64, u16), WorkerManagerError> {
        let mut workers = self.workers.write().await;

        if workers.contains_key(session_id) {
            return Err(WorkerManagerError::SessionAlreadyExists(
                session_id.to_string(),
            ));
        }
        if workers.len() >= self.config.max_instances {
            tracing::warn!(
                session_id,
                max_instances = self.config.max_instances,
                "Worker limit reached",
            );
            return Err(WorkerManagerError::ResourceExhausted {
                max_instances: self.config.max_instances,
            });
        }

        let port = self
            .ports
            .lock()
            .await
            .acquire()
            .await
            .ok_or(WorkerManagerError::NoPortAvailable)?;

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        workers.insert(
            session_id.to_string(),
            ManagedWorker {
                instance,
                process: WorkerProcess::starting(session_id, port),
                channel: None,
            },
        );

        Ok((instance, port))
    }

    /// Poll the endpoint until it answers, then confirm with a no-op.
    async fn wait_until_ready(
        &self,
        session_id: &str,
        pid: u32,
        port: u16,
    ) -> Result<(), WorkerManagerError> {
        let attempts = self.config.startup_poll_attempts;
        let confirm_timeout = self.config.probe_timeout * CONFIRM_TIMEOUT_FACTOR;

        for attempt in 1..=attempts {
            if !self.runtime.is_alive(pid).await {
                return Err(WorkerManagerError::ProcessExitedEarly {
                    session_id: session_id.to_string(),
                });
            }

            match self.transport.probe(port, self.config.probe_timeout).await {
                Ok(()) => {
                    match tokio::time::timeout(
                        confirm_timeout,
                        self.transport.execute(port, NOOP_COMMAND),
                    )
                    .await
                    {
                        Ok(Ok(_)) => {
                            tracing::debug!(session_id, port, attempt, "Worker answered no-op");
                            return Ok(());
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(session_id, attempt, error = %e, "No-op command failed");
                        }
                        Err(_) => {
                            tracing::debug!(session_id, attempt, "No-op command timed out");
                        }
                    }
                }
                Err(e) => {
                    tracing::trace!(session_id, port, attempt, error = %e, "Worker not reachable yet");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.startup_poll_interval).await;
            }
        }

        if !self.runtime.is_alive(pid).await {
            return Err(WorkerManagerError::ProcessExitedEarly {
                session_id: session_id.to_string(),
            });
        }
        Err(WorkerManagerError::StartupTimeout {
            session_id: session_id.to_string(),
            attempts,
        })
    }

    /// Undo a failed spawn: kill the process, drop the record, free the port.
    ///
    /// If the record is already gone, a terminator released the port only
    /// when the record carried a pid.
    async fn discard_failed_spawn(
        &self,
        session_id: &str,
        instance: u64,
        port: u16,
        pid: Option<u32>,
        err: &WorkerManagerError,
    ) {
        tracing::warn!(session_id, error = %err, "Worker failed to start");

        if let Some(pid) = pid {
            self.kill_quietly(session_id, pid).await;
        }

        match self.unregister(session_id, Some(instance)).await {
            Some(mut worker) => {
                worker.process.status = WorkerStatus::Error;
                self.ports.lock().await.release(port);
            }
            None if pid.is_none() => {
                self.ports.lock().await.release(port);
            }
            None => {}
        }

        let _ = self.event_tx.send(WorkerEvent::StartupFailed {
            session_id: session_id.to_string(),
            error: err.to_string(),
        });
    }

    /// Remove a registration, optionally only if it is still `instance`.
    async fn unregister(&self, session_id: &str, instance: Option<u64>) -> Option<ManagedWorker> {
        let mut workers = self.workers.write().await;
        let matches = match (workers.get(session_id), instance) {
            (Some(worker), Some(expected)) => worker.instance == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            workers.remove(session_id)
        } else {
            None
        }
    }

    async fn terminate_instance(
        &self,
        session_id: &str,
        instance: u64,
        reason: TerminationReason,
    ) -> bool {
        match self.unregister(session_id, Some(instance)).await {
            Some(worker) => {
                self.stop_worker(worker, reason).await;
                true
            }
            None => false,
        }
    }

    /// Shut down an already unregistered worker and release its port.
    ///
    /// A worker still being launched has no pid yet. Its port stays leased
    /// and the pending `spawn` kills the process and releases it.
    async fn stop_worker(&self, mut worker: ManagedWorker, reason: TerminationReason) {
        let session_id = worker.process.id.clone();
        let port = worker.process.port;

        if let Some(channel) = worker.channel.take() {
            channel.close();
        }

        if let Some(pid) = worker.process.pid {
            let deadline = Instant::now() + self.config.terminate_grace;

            if worker.process.status == WorkerStatus::Ready && self.runtime.is_alive(pid).await {
                // The worker usually drops the connection while exiting.
                let _ = tokio::time::timeout_at(
                    deadline,
                    self.transport.execute(port, EXIT_COMMAND),
                )
                .await;

                if !self.wait_for_exit(pid, deadline).await {
                    tracing::info!(session_id = %session_id, pid, "Worker did not exit, killing");
                }
            }
            self.kill_quietly(&session_id, pid).await;
        }

        let launching =
            worker.process.status == WorkerStatus::Starting && worker.process.pid.is_none();
        worker.process.status = WorkerStatus::Terminated;
        if !launching {
            self.ports.lock().await.release(port);
        }

        tracing::info!(session_id = %session_id, port, reason = %reason, "Worker terminated");
        let _ = self.event_tx.send(WorkerEvent::Terminated {
            session_id,
            port,
            reason,
        });
    }

    /// Poll until the process exits or `deadline` passes.
    async fn wait_for_exit(&self, pid: u32, deadline: Instant) -> bool {
        loop {
            if !self.runtime.is_alive(pid).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    async fn kill_quietly(&self, session_id: &str, pid: u32) {
        if let Err(e) = self.runtime.kill(pid).await {
            tracing::warn!(session_id, pid, error = %e, "Failed to kill worker process");
        }
    }

    async fn touch(&self, session_id: &str) {
        if let Some(worker) = self.workers.write().await.get_mut(session_id) {
            worker.process.last_active = chrono::Utc::now();
        }
    }

    /// `(session, instance, pid, port, busy)` for every ready worker.
    async fn ready_snapshot(&self) -> Vec<(SessionId, u64, Option<u32>, u16, bool)> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|(_, worker)| worker.process.status == WorkerStatus::Ready)
            .map(|(session_id, worker)| {
                let busy = worker.channel.as_ref().is_some_and(|c| c.depth() > 0);
                (
                    session_id.clone(),
                    worker.instance,
                    worker.process.pid,
                    worker.process.port,
                    busy,
                )
            })
            .collect()
    }
}
