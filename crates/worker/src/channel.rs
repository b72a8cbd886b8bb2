//! Per-worker single-flight command dispatch.
//!
//! Each worker owns one [`CommandChannel`]: an unbounded FIFO drained by a
//! single task. The task issues one command, waits for its reply (bounded
//! by the command watchdog), optionally pauses for the settle delay, and
//! only then takes the next command. Callers on the same worker queue up
//! behind each other; callers on different workers never wait on each
//! other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transport::{CommandOutput, CommandTransport, TransportError};

/// Timing knobs for the drain task.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Watchdog for a single in-flight command.
    pub command_timeout: Duration,
    /// Pause after each command before the next is issued.
    pub settle_delay: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
            settle_delay: Duration::ZERO,
        }
    }
}

struct PendingCommand {
    command: String,
    reply: oneshot::Sender<Result<CommandOutput, TransportError>>,
}

/// Handle to a worker's command FIFO. Cheap to clone.
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::UnboundedSender<PendingCommand>,
    /// Commands queued or in flight.
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl CommandChannel {
    /// Open a channel to the worker on `port` and spawn its drain task.
    ///
    /// The task stops when `cancel` fires or every handle is dropped.
    pub fn open(
        session_id: &str,
        port: u16,
        transport: Arc<dyn CommandTransport>,
        settings: ChannelSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(
            Arc::from(session_id),
            port,
            transport,
            settings,
            rx,
            Arc::clone(&depth),
            cancel.clone(),
        ));

        Self {
            tx,
            depth,
            cancel,
        }
    }

    /// Queue a command and wait for its result.
    pub async fn submit(&self, command: &str) -> Result<CommandOutput, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::SeqCst);
        let pending = PendingCommand {
            command: command.to_string(),
            reply: reply_tx,
        };
        if self.tx.send(pending).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::ChannelClosed);
        }

        reply_rx.await.unwrap_or(Err(TransportError::ChannelClosed))
    }

    /// Commands queued or in flight.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stop the drain task. Queued commands fail with `ChannelClosed`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn drain(
    session_id: Arc<str>,
    port: u16,
    transport: Arc<dyn CommandTransport>,
    settings: ChannelSettings,
    mut rx: mpsc::UnboundedReceiver<PendingCommand>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let pending = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };

        // Caller gave up before its turn came.
        if pending.reply.is_closed() {
            depth.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::ChannelClosed),
            outcome = tokio::time::timeout(
                settings.command_timeout,
                transport.execute(port, &pending.command),
            ) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        port,
                        timeout_secs = settings.command_timeout.as_secs(),
                        "Worker command timed out",
                    );
                    Err(TransportError::Timeout(settings.command_timeout))
                }
            },
        };

        if let Err(e) = &result {
            tracing::debug!(session_id = %session_id, port, error = %e, "Worker command failed");
        }

        let _ = pending.reply.send(result);
        depth.fetch_sub(1, Ordering::SeqCst);

        if !settings.settle_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.settle_delay) => {}
            }
        }
    }

    // Fail whatever is still queued.
    rx.close();
    while let Some(pending) = rx.recv().await {
        let _ = pending.reply.send(Err(TransportError::ChannelClosed));
        depth.fetch_sub(1, Ordering::SeqCst);
    }

    tracing::debug!(session_id = %session_id, port, "Command channel closed");
}
