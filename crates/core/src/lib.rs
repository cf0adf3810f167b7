//! # stevedore-core
//!
//! Shared error type and result helpers for the stevedore workspace.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod result;

pub use error::Error;
pub use result::{Result, ResultExt};
