//! OS process interaction behind a substitutable interface.
//!
//! The manager never touches `tokio::process` directly; it goes through
//! [`WorkerRuntime`], which tests replace with an in-memory fake.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long a worker gets to honour SIGTERM before SIGKILL.
const SIGTERM_WAIT: Duration = Duration::from_secs(2);

/// Everything needed to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub session_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Port the worker's command endpoint binds to.
    pub port: u16,
}

/// OS-level process operations used by the manager.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start the process and return its pid.
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<u32>;

    /// Whether the process is still running.
    async fn is_alive(&self, pid: u32) -> bool;

    /// Stop the process and reap it. Unknown pids are not an error.
    async fn kill(&self, pid: u32) -> io::Result<()>;
}

/// [`WorkerRuntime`] backed by `tokio::process`.
///
/// Children are kept so they can be reaped; `kill_on_drop` guarantees no
/// worker outlives the runtime.
#[derive(Default)]
pub struct OsRuntime {
    children: Mutex<HashMap<u32, Child>>,
}

impl OsRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRuntime for OsRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<u32> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("worker exited before reporting a pid"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, spec.session_id.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, spec.session_id.clone(), "stderr"));
        }

        tracing::info!(
            session_id = %spec.session_id,
            pid,
            port = spec.port,
            program = %spec.program.display(),
            "Worker process launched",
        );

        self.children.lock().await.insert(pid, child);
        Ok(pid)
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&pid) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::info!(pid, %status, "Worker process exited");
                    children.remove(&pid);
                    false
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to poll worker process");
                    false
                }
            },
            None => signal_probe(pid),
        }
    }

    async fn kill(&self, pid: u32) -> io::Result<()> {
        let Some(mut child) = self.children.lock().await.remove(&pid) else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            return Ok(());
        }

        send_sigterm(pid);
        if let Ok(status) = tokio::time::timeout(SIGTERM_WAIT, child.wait()).await {
            tracing::debug!(pid, status = ?status.ok(), "Worker exited after SIGTERM");
            return Ok(());
        }

        tracing::warn!(pid, "Worker ignored SIGTERM, killing");
        child.start_kill()?;
        child.wait().await?;
        Ok(())
    }
}

/// Forward a worker output stream line by line to the log.
async fn forward_output<R: AsyncRead + Unpin>(stream: R, session_id: String, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(session_id = %session_id, stream = name, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session_id = %session_id, stream = name, error = %e, "Output stream failed");
                break;
            }
        }
    }
}

/// Signal 0 probe for processes this runtime did not start.
#[cfg(unix)]
fn signal_probe(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Safety: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn signal_probe(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        // Safety: the pid belongs to a child we have not yet reaped.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
