use std::path::PathBuf;
use std::time::Duration;

use molview_core::command::is_quotable;
use molview_core::env::{parse_or, parse_resolutions, ConfigError};
use molview_core::render::RenderLimits;

/// Render queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root directory for job artifacts.
    pub output_dir: PathBuf,
    /// Global cap on jobs in `Processing`.
    pub max_concurrent_jobs: usize,
    /// Render attempts before the placeholder, including the first.
    pub max_attempts: u32,
    /// Default and maximum image size.
    pub limits: RenderLimits,
    /// Resolutions for degraded attempts, in attempt order.
    pub fallback_resolutions: Vec<(u32, u32)>,
    /// Output files smaller than this are treated as failed renders.
    pub min_file_bytes: u64,
    /// Backoff base; attempt `n` waits `retry_delay * n` first.
    pub retry_delay: Duration,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./renders"),
            max_concurrent_jobs: 3,
            max_attempts: 3,
            limits: RenderLimits::default(),
            fallback_resolutions: vec![(800, 600), (640, 480)],
            min_file_bytes: 1024,
            retry_delay: Duration::from_millis(1000),
            placeholder_width: 800,
            placeholder_height: 600,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default           |
    /// |-------------------------------|-------------------|
    /// | `RENDER_OUTPUT_DIR`           | `./renders`       |
    /// | `RENDER_MAX_CONCURRENT_JOBS`  | `3`               |
    /// | `RENDER_MAX_ATTEMPTS`         | `3`               |
    /// | `RENDER_DEFAULT_WIDTH`        | `800`             |
    /// | `RENDER_DEFAULT_HEIGHT`       | `600`             |
    /// | `RENDER_MAX_WIDTH`            | `2000`            |
    /// | `RENDER_MAX_HEIGHT`           | `2000`            |
    /// | `RENDER_FALLBACK_RESOLUTIONS` | `800x600,640x480` |
    /// | `RENDER_MIN_FILE_BYTES`       | `1024`            |
    /// | `RENDER_RETRY_DELAY_MS`       | `1000`            |
    /// | `RENDER_PLACEHOLDER_WIDTH`    | `800`             |
    /// | `RENDER_PLACEHOLDER_HEIGHT`   | `600`             |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent_jobs: usize =
            parse_or("RENDER_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                key: "RENDER_MAX_CONCURRENT_JOBS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let max_attempts: u32 = parse_or("RENDER_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RENDER_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let fallback_resolutions = match std::env::var("RENDER_FALLBACK_RESOLUTIONS") {
            Ok(raw) if !raw.trim().is_empty() => {
                parse_resolutions("RENDER_FALLBACK_RESOLUTIONS", &raw)?
            }
            _ => defaults.fallback_resolutions,
        };

        let output_dir: String = parse_or(
            "RENDER_OUTPUT_DIR",
            defaults.output_dir.to_string_lossy().into_owned(),
        )?;

        Ok(Self {
            output_dir: output_dir_from(&output_dir)?,
            max_concurrent_jobs,
            max_attempts,
            limits: RenderLimits {
                default_width: parse_or("RENDER_DEFAULT_WIDTH", defaults.limits.default_width)?,
                default_height: parse_or("RENDER_DEFAULT_HEIGHT", defaults.limits.default_height)?,
                max_width: parse_or("RENDER_MAX_WIDTH", defaults.limits.max_width)?,
                max_height: parse_or("RENDER_MAX_HEIGHT", defaults.limits.max_height)?,
            },
            fallback_resolutions,
            min_file_bytes: parse_or("RENDER_MIN_FILE_BYTES", defaults.min_file_bytes)?,
            retry_delay: Duration::from_millis(parse_or("RENDER_RETRY_DELAY_MS", 1000u64)?),
            placeholder_width: parse_or("RENDER_PLACEHOLDER_WIDTH", defaults.placeholder_width)?,
            placeholder_height: parse_or("RENDER_PLACEHOLDER_HEIGHT", defaults.placeholder_height)?,
        })
    }
}

/// Output paths are embedded in the worker's `save` directive, so they
/// must survive quoting intact.
fn output_dir_from(raw: &str) -> Result<PathBuf, ConfigError> {
    if raw.trim().is_empty() || !is_quotable(raw) {
        return Err(ConfigError::Invalid {
            key: "RENDER_OUTPUT_DIR",
            value: raw.to_string(),
            reason: "must be non-empty without quotes, semicolons or line breaks".to_string(),
        });
    }
    Ok(PathBuf::from(raw))
}
