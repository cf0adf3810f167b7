//! Reconciler configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for inference and step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Local development mode: never fetch, save or remove cloud images,
    /// never clean up, never remove volumes of vanished apps.
    #[serde(default)]
    pub local_mode: bool,

    /// Use delta downloads when a base image is available.
    #[serde(default)]
    pub delta: bool,

    /// Maximum concurrent delta downloads.
    #[serde(default = "default_max_delta_downloads")]
    pub max_delta_downloads: usize,

    /// Take update locks by force.
    #[serde(default)]
    pub lock_override: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            delta: false,
            max_delta_downloads: default_max_delta_downloads(),
            lock_override: false,
        }
    }
}

impl ReconcilerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.max_delta_downloads == 0 {
            return Err(Error::invalid_config(
                "max_delta_downloads must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn default_max_delta_downloads() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.max_delta_downloads, 3);
        assert!(!config.local_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_delta_downloads_is_invalid() {
        let config = ReconcilerConfig {
            max_delta_downloads: 0,
            ..ReconcilerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: Option<ReconcilerConfig> = serde_json::from_str(r#"{"delta": true}"#).ok();
        assert_eq!(
            parsed,
            Some(ReconcilerConfig {
                delta: true,
                ..ReconcilerConfig::default()
            })
        );
    }
}
