//! Environment variable helpers shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an optional environment variable. Empty values count as unset.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a required environment variable.
pub(crate) fn require_env(key: &str) -> Result<String, ConfigError> {
    optional_env(key).ok_or_else(|| ConfigError::MissingKey {
        key: key.to_string(),
    })
}

/// Parse an optional environment variable into `T`, falling back to a default.
pub(crate) fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}
