//! Worker command endpoint transport.
//!
//! Each worker exposes a local REST endpoint:
//! `GET http://127.0.0.1:{port}/run?command=...` runs one engine command
//! and answers with a JSON document carrying the command's return values,
//! its log output, and an error object when the command failed.
//! [`CommandTransport`] is the seam the manager and the command channel
//! talk through; [`RestTransport`] is the production implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Command used to confirm that a freshly started worker is interactive.
pub const NOOP_COMMAND: &str = "version";

/// Command that asks a worker to exit cleanly.
pub const EXIT_COMMAND: &str = "exit";

/// Errors from the worker command endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request itself failed (connection refused, reset, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status code.
    #[error("Worker endpoint error ({status}): {body}")]
    Status { status: u16, body: String },

    /// The command did not complete within the watchdog timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// The command channel shut down before the command ran.
    #[error("Command channel closed")]
    ChannelClosed,

    /// The engine ran the command and reported a failure.
    #[error("{0}")]
    Engine(String),
}

/// Error object in an engine reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineFault {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// Structured result of one engine command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    /// JSON return values, one per executed sub-command.
    #[serde(default, rename = "json values")]
    pub values: Vec<serde_json::Value>,
    /// Log lines keyed by level (`info`, `warning`, `error`, ...).
    #[serde(default, rename = "log messages")]
    pub log: BTreeMap<String, Vec<String>>,
    /// Present when the command failed.
    #[serde(default)]
    pub error: Option<EngineFault>,
}

impl CommandOutput {
    /// Parse a reply body. Non-JSON bodies are kept as a single info line.
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| {
            let mut log = BTreeMap::new();
            let text = body.trim();
            if !text.is_empty() {
                log.insert("info".to_string(), vec![text.to_string()]);
            }
            Self {
                values: Vec::new(),
                log,
                error: None,
            }
        })
    }

    /// Error-level log lines, if any.
    pub fn errors(&self) -> &[String] {
        self.log.get("error").map(Vec::as_slice).unwrap_or_default()
    }

    /// Turn an engine-reported failure into [`TransportError::Engine`].
    pub fn into_result(self) -> Result<Self, TransportError> {
        if let Some(fault) = &self.error {
            let message = if fault.message.is_empty() {
                fault.kind.clone()
            } else {
                fault.message.clone()
            };
            return Err(TransportError::Engine(message));
        }
        if let Some(first) = self.errors().first() {
            return Err(TransportError::Engine(first.clone()));
        }
        Ok(self)
    }
}

/// How the manager reaches a worker's command endpoint.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Succeeds if anything answers on `port` within `timeout`.
    async fn probe(&self, port: u16, timeout: Duration) -> Result<(), TransportError>;

    /// Run one command and wait for its completion.
    async fn execute(&self, port: u16, command: &str) -> Result<CommandOutput, TransportError>;
}

/// HTTP client for worker REST endpoints on the local host.
pub struct RestTransport {
    client: reqwest::Client,
    host: String,
}

impl RestTransport {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            host: "127.0.0.1".to_string(),
        }
    }

    fn base_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.host)
    }
}

impl Default for RestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandTransport for RestTransport {
    async fn probe(&self, port: u16, timeout: Duration) -> Result<(), TransportError> {
        // Any HTTP answer means the endpoint is up; the status is irrelevant.
        self.client
            .get(format!("{}/", self.base_url(port)))
            .timeout(timeout)
            .send()
            .await?;
        Ok(())
    }

    async fn execute(&self, port: u16, command: &str) -> Result<CommandOutput, TransportError> {
        let response = self
            .client
            .get(format!("{}/run", self.base_url(port)))
            .query(&[("command", command)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        CommandOutput::parse(&body).into_result()
    }
}
