//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event bus error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Every sender was dropped.
    #[error("event channel closed")]
    ChannelClosed,

    /// The subscriber fell behind and events were overwritten.
    #[error("subscriber lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },
}
