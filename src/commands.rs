//! CLI command handlers.
//!
//! Every command drives an [`ApplicationManager`] over an in-memory engine
//! seeded from a device file, so plans and runs can be inspected without
//! touching a real container engine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use stevedore_reconciler::{
    ApplicationManager, DeviceStatus, Error as ReconcilerError, ExecuteOptions, InMemoryEngine,
    ReconciliationLoop, Step,
};
use tokio::signal;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::DeviceConfig;
use crate::snapshot::{DeviceSnapshot, load_target};

/// Execute a CLI command.
///
/// This is the main command dispatcher that routes to the appropriate handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { device, target } => cmd_plan(&config, &device, &target).await,
        Commands::Apply {
            device,
            target,
            max_passes,
            force,
        } => cmd_apply(&config, &device, &target, max_passes, force).await,
        Commands::Run { device, target } => cmd_run(&config, &device, &target).await,
        Commands::Status { device } => cmd_status(&config, &device).await,
        Commands::Config => cmd_config(&config),
    }
}

/// Load and validate the device configuration.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a value is invalid.
pub fn load_config(path: Option<&Path>) -> Result<DeviceConfig> {
    let config = DeviceConfig::load_or_default(path).with_context(|| match path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load default configuration".to_string(),
    })?;
    config
        .validate()
        .map_err(|reason| anyhow!("Invalid configuration: {reason}"))?;
    Ok(config)
}

/// A manager over a simulated engine.
pub struct Device {
    pub manager: Arc<ApplicationManager>,
    pub engine: Arc<InMemoryEngine>,
}

/// Seed an engine from `device` and, when given, store `target`.
///
/// Apps that fail their contracts keep their previous (empty) target; the
/// rest of the target is applied.
///
/// # Errors
///
/// Returns an error if a file cannot be loaded or the manager cannot be
/// built.
pub async fn open_device(
    config: &DeviceConfig,
    device: &Path,
    target: Option<&Path>,
) -> Result<Device> {
    let snapshot = DeviceSnapshot::load(device)
        .with_context(|| format!("Failed to load device state from {}", device.display()))?;

    let engine = Arc::new(snapshot.engine().await);
    let commits = Arc::new(
        snapshot
            .commit_store()
            .await
            .context("Invalid commits in device state")?,
    );

    let manager = ApplicationManager::builder()
        .with_engine(engine.clone())
        .with_commits(commits)
        .with_config(config.reconciler.clone())
        .with_capabilities(config.capabilities.clone())
        .build()
        .context("Failed to build application manager")?;

    if let Some(target) = target {
        let records = load_target(target)
            .with_context(|| format!("Failed to load target state from {}", target.display()))?;
        match manager.set_target(records).await {
            Ok(()) => {}
            Err(ReconcilerError::ContractViolation { violators }) => {
                warn!(apps = ?violators.keys().collect::<Vec<_>>(), "Apps skipped: unmet contracts");
            }
            Err(e) => return Err(e).context("Failed to store target state"),
        }
    }

    Ok(Device {
        manager: Arc::new(manager),
        engine,
    })
}

/// Outcome of [`apply`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub passes: usize,
    pub steps_taken: usize,
    pub status: DeviceStatus,
}

/// Next steps toward the target.
///
/// # Errors
///
/// Returns an error if loading fails or inference finds inconsistent state.
pub async fn plan(config: &DeviceConfig, device: &Path, target: &Path) -> Result<Vec<Step>> {
    let device = open_device(config, device, Some(target)).await?;
    device
        .manager
        .next_steps()
        .await
        .context("Failed to infer next steps")
}

/// Run passes until one has nothing left to do.
///
/// # Errors
///
/// Returns an error if loading fails, a pass cannot be inferred, or the
/// device has not converged after `max_passes`.
pub async fn apply(
    config: &DeviceConfig,
    device: &Path,
    target: &Path,
    max_passes: usize,
    force: bool,
) -> Result<ApplyReport> {
    let device = open_device(config, device, Some(target)).await?;
    let options = ExecuteOptions {
        force,
        ..ExecuteOptions::default()
    };

    let mut steps_taken = 0usize;
    for pass in 1..=max_passes {
        let result = device
            .manager
            .apply_target(options)
            .await
            .with_context(|| format!("Pass {pass} failed"))?;

        for (step, reason) in &result.failed {
            warn!(pass, action = step.action_name(), %reason, "Step failed");
        }
        steps_taken = steps_taken.saturating_add(result.taken.len());
        info!(
            pass,
            taken = result.taken.len(),
            failed = result.failed.len(),
            "Pass complete"
        );

        if result.converged {
            let status = device.manager.status().await.context("Failed to read status")?;
            return Ok(ApplyReport {
                passes: pass,
                steps_taken,
                status,
            });
        }
    }

    bail!("Device did not converge after {max_passes} passes")
}

async fn cmd_plan(config: &DeviceConfig, device: &Path, target: &Path) -> Result<()> {
    let steps = plan(config, device, target).await?;
    info!(steps = steps.len(), "Planned next steps");
    print_json(&steps)
}

async fn cmd_apply(
    config: &DeviceConfig,
    device: &Path,
    target: &Path,
    max_passes: usize,
    force: bool,
) -> Result<()> {
    let report = apply(config, device, target, max_passes, force).await?;
    info!(
        passes = report.passes,
        steps = report.steps_taken,
        "Device converged"
    );
    print_json(&report)
}

async fn cmd_run(config: &DeviceConfig, device: &Path, target: &Path) -> Result<()> {
    let device = open_device(config, device, Some(target)).await?;
    let mut runner = ReconciliationLoop::new(device.manager.clone(), config.loop_config());
    let stopper = runner.stopper();
    let mut handle = tokio::spawn(async move { runner.run().await });

    info!("stevedore is running. Press Ctrl+C to stop.");

    tokio::select! {
        () = wait_for_shutdown() => {
            stopper.stop();
            handle.await.context("Reconciliation loop panicked")??;
        }
        joined = &mut handle => {
            joined.context("Reconciliation loop panicked")??;
        }
    }

    let status = device.manager.status().await.context("Failed to read status")?;
    print_json(&status)
}

async fn cmd_status(config: &DeviceConfig, device: &Path) -> Result<()> {
    let device = open_device(config, device, None).await?;
    let status = device.manager.status().await.context("Failed to read status")?;
    print_json(&status)
}

fn cmd_config(config: &DeviceConfig) -> Result<()> {
    let rendered = config.to_toml().context("Failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
