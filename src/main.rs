//! # stevedore - Device Supervisor Entry Point
//!
//! ## Commands
//!
//! - **plan** - Infer the next steps from a device file and a target file
//! - **apply** - Run passes against a simulated engine until it converges
//! - **run** - Run the reconciliation loop until Ctrl+C
//! - **status** - Print the status report of a device file
//! - **config** - Validate and print the effective configuration
//!
//! ## Error Handling
//!
//! Library errors are typed; this binary wraps them with `anyhow` context so
//! a failure names the file or pass it came from.
//!
//! ## Logging
//!
//! Logs go to stderr and follow `RUST_LOG` (default `info`). Command output
//! goes to stdout as JSON or TOML.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use stevedore::cli::Cli;
use stevedore::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    execute_command(cli).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
