use std::path::PathBuf;
use std::time::Duration;

use molview_core::env::{parse_or, ConfigError};

use crate::channel::ChannelSettings;
use crate::runtime::LaunchSpec;

/// Placeholder in [`WorkerConfig::worker_args`] replaced by the leased port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Worker supervision configuration.
///
/// All fields have defaults suitable for a single host running the
/// engine from `PATH`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Engine executable.
    pub worker_binary: PathBuf,
    /// Startup arguments; [`PORT_PLACEHOLDER`] is substituted per worker.
    pub worker_args: Vec<String>,
    /// First port of the command-endpoint pool.
    pub base_port: u16,
    /// Maximum concurrently registered workers (and size of the port pool).
    pub max_instances: usize,
    /// Workers idle for longer than this are terminated by the health check.
    pub idle_timeout: Duration,
    /// Period of the background health-check loop.
    pub health_check_interval: Duration,
    /// Number of readiness probes before a spawn fails with `StartupTimeout`.
    pub startup_poll_attempts: u32,
    /// Delay between readiness probes.
    pub startup_poll_interval: Duration,
    /// Timeout for a single readiness or health probe.
    pub probe_timeout: Duration,
    /// Watchdog for a single in-flight command.
    pub command_timeout: Duration,
    /// Pause after each command before the next one is issued.
    pub command_settle_delay: Duration,
    /// Time a worker gets to exit after the graceful exit command.
    pub terminate_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_binary: PathBuf::from("chimerax"),
            worker_args: default_worker_args(),
            base_port: 50000,
            max_instances: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(5 * 60),
            startup_poll_attempts: 60,
            startup_poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_secs(120),
            command_settle_delay: Duration::ZERO,
            terminate_grace: Duration::from_millis(3000),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default                          |
    /// |-----------------------------------|----------------------------------|
    /// | `WORKER_BINARY`                   | `chimerax`                       |
    /// | `WORKER_ARGS`                     | headless REST startup (see code) |
    /// | `WORKER_BASE_PORT`                | `50000`                          |
    /// | `WORKER_MAX_INSTANCES`            | `10`                             |
    /// | `WORKER_IDLE_TIMEOUT_SECS`        | `1800`                           |
    /// | `WORKER_HEALTH_INTERVAL_SECS`     | `300`                            |
    /// | `WORKER_STARTUP_POLL_ATTEMPTS`    | `60`                             |
    /// | `WORKER_STARTUP_POLL_INTERVAL_MS` | `500`                            |
    /// | `WORKER_PROBE_TIMEOUT_MS`         | `1000`                           |
    /// | `WORKER_COMMAND_TIMEOUT_SECS`     | `120`                            |
    /// | `WORKER_COMMAND_SETTLE_MS`        | `0`                              |
    /// | `WORKER_TERMINATE_GRACE_MS`       | `3000`                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let worker_binary: String = parse_or(
            "WORKER_BINARY",
            defaults.worker_binary.to_string_lossy().into_owned(),
        )?;
        let worker_args = match std::env::var("WORKER_ARGS") {
            Ok(raw) if !raw.trim().is_empty() => split_args(&raw).map_err(|reason| {
                ConfigError::Invalid {
                    key: "WORKER_ARGS",
                    value: raw.clone(),
                    reason,
                }
            })?,
            _ => defaults.worker_args,
        };

        let max_instances: usize = parse_or("WORKER_MAX_INSTANCES", defaults.max_instances)?;
        if max_instances == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_MAX_INSTANCES",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            worker_binary: PathBuf::from(worker_binary),
            worker_args,
            base_port: parse_or("WORKER_BASE_PORT", defaults.base_port)?,
            max_instances,
            idle_timeout: Duration::from_secs(parse_or("WORKER_IDLE_TIMEOUT_SECS", 1800u64)?),
            health_check_interval: Duration::from_secs(parse_or(
                "WORKER_HEALTH_INTERVAL_SECS",
                300u64,
            )?),
            startup_poll_attempts: parse_or(
                "WORKER_STARTUP_POLL_ATTEMPTS",
                defaults.startup_poll_attempts,
            )?,
            startup_poll_interval: Duration::from_millis(parse_or(
                "WORKER_STARTUP_POLL_INTERVAL_MS",
                500u64,
            )?),
            probe_timeout: Duration::from_millis(parse_or("WORKER_PROBE_TIMEOUT_MS", 1000u64)?),
            command_timeout: Duration::from_secs(parse_or("WORKER_COMMAND_TIMEOUT_SECS", 120u64)?),
            command_settle_delay: Duration::from_millis(parse_or("WORKER_COMMAND_SETTLE_MS", 0u64)?),
            terminate_grace: Duration::from_millis(parse_or("WORKER_TERMINATE_GRACE_MS", 3000u64)?),
        })
    }

    /// Launch specification for a worker bound to `port`.
    pub fn launch_spec(&self, session_id: &str, port: u16) -> LaunchSpec {
        let port_str = port.to_string();
        LaunchSpec {
            session_id: session_id.to_string(),
            program: self.worker_binary.clone(),
            args: self
                .worker_args
                .iter()
                .map(|arg| arg.replace(PORT_PLACEHOLDER, &port_str))
                .collect(),
            port,
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            command_timeout: self.command_timeout,
            settle_delay: self.command_settle_delay,
        }
    }
}

fn default_worker_args() -> Vec<String> {
    vec![
        "--nogui".to_string(),
        "--offscreen".to_string(),
        "--silent".to_string(),
        "--cmd".to_string(),
        format!("remotecontrol rest start port {PORT_PLACEHOLDER} json true"),
    ]
}

/// Split a command line on whitespace, honouring double quotes.
fn split_args(raw: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated double quote".to_string());
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}
