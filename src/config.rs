//! App configuration
//!
//! Optional YAML file; every field has a default and `periscope app` flags
//! override file values.

use crate::error::{PeriscopeError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Address the HTTP API listens on. Default: 0.0.0.0:4040.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// How long received reports contribute to the merged view. Default: 15s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Unique app id served in `Details`; random when empty.
    #[serde(default)]
    pub app_id: String,

    /// Probe report streams (`host:port`) to pull from.
    #[serde(default)]
    pub push_probes: Vec<String>,

    /// How often pulled reports are handed to the collector. Default: 3s.
    #[serde(default = "default_batch_time", with = "humantime_serde")]
    pub batch_time: Duration,
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", periscope_common::xfer::APP_PORT)
}

fn default_window() -> Duration {
    Duration::from_secs(15)
}

fn default_batch_time() -> Duration {
    Duration::from_secs(3)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            window: default_window(),
            app_id: String::new(),
            push_probes: Vec::new(),
            batch_time: default_batch_time(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&data)
            .map_err(|e| PeriscopeError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(PeriscopeError::ConfigError(
                "listen address is required".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(PeriscopeError::ConfigError(
                "window must be positive".to_string(),
            ));
        }
        if !self.push_probes.is_empty() && self.batch_time.is_zero() {
            return Err(PeriscopeError::ConfigError(
                "batch_time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.listen, "0.0.0.0:4040");
        assert_eq!(config.window, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "listen: \"127.0.0.1:9000\"\nwindow: 30s\npush_probes: [\"10.0.0.5:4041\"]"
        )
        .expect("write config");

        let config = AppConfig::load(file.path()).expect("load");
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.window, Duration::from_secs(30));
        assert_eq!(config.push_probes, vec!["10.0.0.5:4041"]);
        assert_eq!(config.batch_time, Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_zero_window() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "window: 0s").expect("write config");
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(PeriscopeError::ConfigError(_))
        ));
    }
}
