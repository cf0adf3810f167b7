#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # stevedore
//!
//! Device-resident container supervisor. Reads a device configuration, a
//! device state file and a target state file, and drives the reconciler
//! over them.
//!
//! This library re-exports the workspace crates for convenience.

pub use stevedore_core;
pub use stevedore_events;
pub use stevedore_reconciler;

pub mod cli;
pub mod commands;
pub mod config;
pub mod snapshot;

pub use config::DeviceConfig;
pub use snapshot::DeviceSnapshot;
