//! Probe configuration
//!
//! Loaded from an optional YAML file; every field has a default and CLI
//! flags override file values.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// Apps to publish to: hostnames, `host:port` or URLs. Default: localhost.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,

    /// Token sent in the `Authorization` header.
    #[serde(default)]
    pub token: String,

    /// Unique probe id; a random one is generated when empty.
    #[serde(default)]
    pub probe_id: String,

    /// How often tickers run. Default: 1s.
    #[serde(default = "default_spy_interval", with = "humantime_serde")]
    pub spy_interval: Duration,

    /// How often reports are generated and published. Default: 3s.
    #[serde(default = "default_publish_interval", with = "humantime_serde")]
    pub publish_interval: Duration,

    /// How often targets are re-resolved. Default: 10s.
    #[serde(default = "default_resolve_interval", with = "humantime_serde")]
    pub resolve_interval: Duration,

    /// Address to stream reports on for push collectors, if any.
    #[serde(default)]
    pub stream_listen: Option<String>,

    /// Shell started by the host exec control. Default: /bin/sh.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Disable all controls.
    #[serde(default)]
    pub no_controls: bool,

    /// How long shutdown waits for in-flight report generation. Default: 5s.
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,
}

fn default_targets() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_spy_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_resolve_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            token: String::new(),
            probe_id: String::new(),
            spy_interval: default_spy_interval(),
            publish_interval: default_publish_interval(),
            resolve_interval: default_resolve_interval(),
            stream_listen: None,
            shell: default_shell(),
            no_controls: false,
            stop_grace: default_stop_grace(),
        }
    }
}

impl ProbeConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProbeConfig =
            serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() && self.stream_listen.is_none() {
            return Err(ConfigError::Invalid(
                "at least one target or stream_listen is required".to_string(),
            ));
        }
        if self.spy_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "spy_interval must be positive".to_string(),
            ));
        }
        if self.publish_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "publish_interval must be positive".to_string(),
            ));
        }
        if self.resolve_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "resolve_interval must be positive".to_string(),
            ));
        }
        if !self.no_controls && self.shell.is_empty() {
            return Err(ConfigError::Invalid(
                "shell is required when controls are enabled".to_string(),
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
    fn test_defaults_are_valid() {
        let config = ProbeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.targets, vec!["localhost"]);
        assert_eq!(config.publish_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "targets: [\"app.example.com\", \"10.0.0.1:4040\"]\n\
             token: s3cret\n\
             publish_interval: 15s\n\
             stream_listen: \"0.0.0.0:4041\""
        )
        .expect("write config");

        let config = ProbeConfig::load(file.path()).expect("load");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.publish_interval, Duration::from_secs(15));
        assert_eq!(config.spy_interval, Duration::from_secs(1));
        assert_eq!(config.stream_listen.as_deref(), Some("0.0.0.0:4041"));
    }

    #[test]
    fn test_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "spy_interval: 0s").expect("write config");
        assert!(matches!(
            ProbeConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "no_such_field: true").expect("write config");
        assert!(matches!(
            ProbeConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
