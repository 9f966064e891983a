//! Runtime configuration for the companion core

use serde::Deserialize;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[cfg(feature = "config-file")]
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Runtime configuration for the companion core
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Device name presented to peers
    pub device_name: String,

    /// Firmware revision reported in the version announcement
    pub fw_revision: String,

    /// Hardware revision reported in the version announcement
    pub hw_revision: String,

    /// Whether interactive pairing is enabled at boot
    pub pairable_on_boot: bool,

    /// Seconds between status heartbeats
    pub status_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_name: "Wristlink".to_string(),
            fw_revision: env!("CARGO_PKG_VERSION").to_string(),
            hw_revision: "rev-a".to_string(),
            pairable_on_boot: false,
            status_interval_secs: 1,
        }
    }
}

#[cfg(feature = "config-file")]
impl CoreConfig {
    /// Load configuration from an optional file plus `WRISTLINK_*`
    /// environment overrides. Missing keys fall back to the defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("WRISTLINK"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();

        assert_eq!(config.device_name, "Wristlink");
        assert!(!config.pairable_on_boot);
        assert_eq!(config.status_interval_secs, 1);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_from_file_with_defaults_for_missing_keys() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wristlink.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "device_name = \"Test Watch\"").unwrap();
        writeln!(file, "pairable_on_boot = true").unwrap();

        let config = CoreConfig::load(path.to_str()).unwrap();

        assert_eq!(config.device_name, "Test Watch");
        assert!(config.pairable_on_boot);
        // untouched keys keep their defaults
        assert_eq!(config.hw_revision, "rev-a");
    }
}
