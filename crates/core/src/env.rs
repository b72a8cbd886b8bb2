//! Environment-variable configuration helpers.
//!
//! Each subsystem documents its own variables and defaults; this module
//! only supplies the parsing so that a malformed value is reported with
//! the offending key instead of silently falling back.

use std::str::FromStr;

/// Errors produced while loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Read `key` from the environment, falling back to `default` when unset.
pub fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(key, std::env::var(key).ok(), default)
}

/// Parse an optional raw value, falling back to `default` when absent or blank.
pub fn parse_value<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Parse a comma-separated list of `WIDTHxHEIGHT` pairs, e.g. `800x600,640x480`.
pub fn parse_resolutions(key: &'static str, raw: &str) -> Result<Vec<(u32, u32)>, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (w, h) = pair
                .split_once(['x', 'X'])
                .ok_or_else(|| invalid("expected WIDTHxHEIGHT"))?;
            let width: u32 = w.trim().parse().map_err(|_| invalid("width is not a number"))?;
            let height: u32 = h.trim().parse().map_err(|_| invalid("height is not a number"))?;
            if width == 0 || height == 0 {
                return Err(invalid("dimensions must be positive"));
            }
            Ok((width, height))
        })
        .collect()
}
