//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod types;

pub use types::{AnrConfig, InputConfig, LoggingConfig, ServerConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// ANR configuration
    #[serde(default)]
    pub anr: AnrConfig,
    /// Input pipeline configuration
    #[serde(default)]
    pub input: InputConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Override config values with CLI arguments
    pub fn with_overrides(mut self, socket_path: Option<PathBuf>) -> Self {
        if let Some(path) = socket_path {
            self.server.socket_path = path;
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.max_sessions == 0 {
            bail!("server.max_sessions must be at least 1");
        }
        if self.anr.timeout_ms == 0 {
            bail!("anr.timeout_ms must be at least 1");
        }
        match self.logging.format.as_str() {
            "json" | "pretty" | "compact" => {}
            other => bail!("logging.format must be json|pretty|compact, got '{}'", other),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config().unwrap();
        assert_eq!(config.anr.timeout_ms, 5000);
        assert_eq!(config.server.max_sessions, 64);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            socket_path = "/tmp/hub.sock"
            max_sessions = 8

            [anr]
            timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/hub.sock"));
        assert_eq!(config.anr.timeout_ms, 2500);
        // Unspecified sections fall back to defaults.
        assert!(config.input.enable_touch_gestures);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.server.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let config = Config::default().with_overrides(Some(PathBuf::from("/tmp/other.sock")));
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/other.sock"));
    }
}
