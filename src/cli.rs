//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// stevedore - device container supervisor
#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(version)]
#[command(about = "Reconciles the apps running on a device toward a declared target")]
#[command(
    long_about = "stevedore compares the containers, networks, volumes and images on a device with a target state and works out the next safe steps: downloads before starts, kills before network removal, update strategies and update locks honoured."
)]
pub struct Cli {
    /// Device configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the next steps toward the target without running them
    Plan {
        /// Device state file (JSON)
        #[arg(short, long)]
        device: PathBuf,

        /// Target state file (JSON)
        #[arg(short, long)]
        target: PathBuf,
    },

    /// Run passes against a simulated engine until the device converges
    Apply {
        /// Device state file (JSON)
        #[arg(short, long)]
        device: PathBuf,

        /// Target state file (JSON)
        #[arg(short, long)]
        target: PathBuf,

        /// Give up after this many passes
        #[arg(long, default_value_t = 20)]
        max_passes: usize,

        /// Take update locks by force
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },

    /// Run the reconciliation loop until Ctrl+C
    Run {
        /// Device state file (JSON)
        #[arg(short, long)]
        device: PathBuf,

        /// Target state file (JSON)
        #[arg(short, long)]
        target: PathBuf,
    },

    /// Print the device status report
    Status {
        /// Device state file (JSON)
        #[arg(short, long)]
        device: PathBuf,
    },

    /// Validate and print the effective configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_arguments() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "plan",
            "--device",
            "device.json",
            "--target",
            "target.json",
        ]);

        assert!(cli.is_ok_and(|cli| matches!(
            cli.command,
            Commands::Plan { ref device, .. } if device == &PathBuf::from("device.json")
        )));
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::try_parse_from(["stevedore", "config", "--config", "agent.toml"]);

        assert!(cli.is_ok_and(|cli| cli.config == Some(PathBuf::from("agent.toml"))));
    }

    #[test]
    fn test_apply_defaults() {
        let cli = Cli::try_parse_from(["stevedore", "apply", "-d", "d.json", "-t", "t.json"]);

        assert!(cli.is_ok_and(|cli| matches!(
            cli.command,
            Commands::Apply {
                max_passes: 20,
                force: false,
                ..
            }
        )));
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let cli = Cli::try_parse_from(["stevedore", "plan", "--device", "device.json"]);
        assert!(cli.is_err());
    }
}
