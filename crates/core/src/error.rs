//! Core error types for stevedore.
//!
//! Errors here cover reading and parsing the files the agent is fed with:
//! device configuration, state snapshots and target records.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for stevedore operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

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

    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::json_parse_failed(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::toml_parse_failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_read_error_names_the_path() {
        let err = Error::file_read_failed("/etc/stevedore.toml", "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("/etc/stevedore.toml"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn json_errors_convert() {
        let parsed: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err = parsed.map_err(Error::from);
        assert!(matches!(err, Err(Error::JsonParseFailed { .. })));
    }

    #[test]
    fn toml_errors_convert() {
        #[derive(Debug, serde::Deserialize)]
        struct Probe {
            #[allow(dead_code)]
            delta: bool,
        }
        let parsed: std::result::Result<Probe, _> = toml::from_str("delta = \"maybe\"");
        let err = parsed.map_err(Error::from);
        assert!(matches!(err, Err(Error::TomlParseFailed { .. })));
    }
}
