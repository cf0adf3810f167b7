//! Error types for the reconciler crate.

use std::collections::BTreeMap;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Required identity fields are missing; the pass is aborted.
    #[error("internal inconsistency: {reason}")]
    InternalInconsistency { reason: String },

    /// An application key could not be parsed as an integer.
    #[error("invalid app id '{id}'")]
    InvalidAppId { id: String },

    /// One or more apps of a new target failed their contracts.
    /// Keyed by app name, listing the unmet services.
    #[error("contract violation: {}", format_violators(.violators))]
    ContractViolation {
        violators: BTreeMap<String, Vec<String>>,
    },

    /// A step action that nobody knows how to execute.
    #[error("invalid action '{action}'")]
    InvalidAction { action: String },

    /// Inference was asked to ignore images but still produced a fetch.
    #[error("cannot fetch images while executing an API action")]
    FetchWhileIgnoringImages,

    /// Updates for the app are held by a user lock.
    #[error("updates are locked for app {app_id}")]
    UpdatesLocked { app_id: u32 },

    /// Waiting for the app lock took too long.
    #[error("timed out waiting for the update lock of app {app_id}")]
    LockTimeout { app_id: u32 },

    /// A collaborator (engine, image store, ...) failed.
    #[error("{operation} failed: {reason}")]
    Collaborator { operation: String, reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Loop was stopped.
    #[error("reconciliation loop stopped")]
    LoopStopped,

    /// Too many consecutive failed passes.
    #[error("reconciliation failed: {reason}")]
    ReconcileFailed { reason: String },

    #[error(transparent)]
    Core(#[from] stevedore_core::Error),
}

fn format_violators(violators: &BTreeMap<String, Vec<String>>) -> String {
    violators
        .iter()
        .map(|(app, services)| format!("{app}: {}", services.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an internal inconsistency error.
    pub fn internal_inconsistency(reason: impl Into<String>) -> Self {
        Self::InternalInconsistency {
            reason: reason.into(),
        }
    }

    /// Create an invalid app id error.
    pub fn invalid_app_id(id: impl Into<String>) -> Self {
        Self::InvalidAppId { id: id.into() }
    }

    /// Create an invalid action error.
    pub fn invalid_action(action: impl Into<String>) -> Self {
        Self::InvalidAction {
            action: action.into(),
        }
    }

    /// Create a collaborator error.
    pub fn collaborator(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a reconcile failed error.
    pub fn reconcile_failed(reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::internal_inconsistency("image without imageId");
        assert!(err.to_string().contains("image without imageId"));
    }

    #[test]
    fn test_collaborator() {
        let err = Error::collaborator("kill", "engine timeout");
        assert!(err.to_string().contains("kill"));
        assert!(err.to_string().contains("engine timeout"));
    }

    #[test]
    fn contract_violation_lists_services() {
        let mut violators = BTreeMap::new();
        violators.insert("app".to_string(), vec!["gpu".to_string(), "ml".to_string()]);
        let err = Error::ContractViolation { violators };
        assert_eq!(err.to_string(), "contract violation: app: gpu, ml");
    }
}
