//! Core error types for benchrig configuration and parsing.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for benchrig operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid host specification '{spec}': {reason}")]
    InvalidHostSpec { spec: String, reason: String },

    // Configuration errors
    #[error("mandatory configuration key [{section}.{key}] is missing")]
    MissingConfigKey { section: String, key: String },

    #[error("invalid value for configuration key [{section}.{key}]: {reason}")]
    InvalidConfigValue {
        section: String,
        key: String,
        reason: String,
    },

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid host specification error.
    pub fn invalid_host_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHostSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing configuration key error.
    pub fn missing_config_key(section: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingConfigKey {
            section: section.into(),
            key: key.into(),
        }
    }

    /// Create an invalid configuration value error.
    pub fn invalid_config_value(
        section: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfigValue {
            section: section.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}
