//! Result alias and extension helpers.

use crate::error::Error;

/// The standard Result type for stevedore core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for any `Result`.
///
/// Used where a failure should degrade to a fallback instead of aborting,
/// e.g. an optional collaborator query during a reconciliation pass.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T) -> T;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&dyn std::fmt::Display)>(self, f: F) -> Self;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Operation failed: {}", e);
                None
            }
        }
    }

    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Operation failed, using default: {}", e);
                default
            }
        }
    }

    fn inspect_error<F: FnOnce(&dyn std::fmt::Display)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
