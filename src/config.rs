//! Device configuration file.
//!
//! ```toml
//! [reconciler]
//! local_mode = false
//! delta = true
//! max_delta_downloads = 3
//!
//! [loop]
//! interval_ms = 1000
//! max_errors = 10
//!
//! [capabilities]
//! "sw.os" = "2.88.4"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stevedore_reconciler::{DeviceCapabilities, LoopConfig, ReconcilerConfig};

/// Reconciliation loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSettings {
    /// Milliseconds between periodic passes.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failed passes before the loop gives up.
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// Stop on the first failed pass.
    #[serde(default)]
    pub stop_on_error: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_errors: default_max_errors(),
            stop_on_error: false,
        }
    }
}

/// Everything the agent reads from its configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default, rename = "loop")]
    pub reconcile_loop: LoopSettings,

    /// Contract types the device provides, with their versions.
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl DeviceConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read and
    /// `TomlParseFailed` if it is not a valid configuration.
    pub fn load(path: &Path) -> stevedore_core::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| stevedore_core::Error::file_read_failed(path, e.to_string()))?;
        Self::parse(&raw)
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` if the text is not a valid configuration.
    pub fn parse(raw: &str) -> stevedore_core::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load `path` when given, defaults otherwise.
    ///
    /// # Errors
    ///
    /// See [`DeviceConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> stevedore_core::Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error message naming the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        self.reconciler.validate().map_err(|e| e.to_string())?;

        if self.reconcile_loop.interval_ms == 0 {
            return Err("loop.interval_ms must be greater than 0".to_string());
        }

        if self.reconcile_loop.max_errors == 0 {
            return Err("loop.max_errors must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Settings for [`stevedore_reconciler::ReconciliationLoop`].
    #[must_use]
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            interval: Duration::from_millis(self.reconcile_loop.interval_ms),
            max_errors: self.reconcile_loop.max_errors,
            stop_on_error: self.reconcile_loop.stop_on_error,
        }
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_errors() -> usize {
    10
}
