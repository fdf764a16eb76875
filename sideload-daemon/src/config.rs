//! Daemon Configuration
//!
//! Configuration management for the sideload daemon.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sideload_core::{DEFAULT_BRIDGE_PROGRAM, DEFAULT_IDLE_TIMEOUT};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Staging area configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Status event output configuration
    #[serde(default)]
    pub events: EventsConfig,
}

/// Device bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge program to invoke (name on PATH or absolute path)
    #[serde(default = "default_bridge_program")]
    pub program: String,

    /// Kill a push that produces no output for this many seconds
    #[serde(default = "default_push_idle_timeout_secs")]
    pub push_idle_timeout_secs: u64,
}

/// Staging area configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory scanned for files to push
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
}

/// Status event output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Emit status events as JSON lines on stdout instead of log records
    #[serde(default)]
    pub json: bool,
}

fn default_bridge_program() -> String {
    DEFAULT_BRIDGE_PROGRAM.to_string()
}

fn default_push_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_staging_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("sideload")
        .join("staging")
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: default_bridge_program(),
            push_idle_timeout_secs: default_push_idle_timeout_secs(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { json: false }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            staging: StagingConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("sideload")
            .join("daemon.toml")
    }

    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.staging.dir).with_context(|| {
            format!(
                "Failed to create staging directory {}",
                self.staging.dir.display()
            )
        })?;
        Ok(())
    }

    /// Push inactivity timeout as a duration
    pub fn push_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.push_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.program, "adb");
        assert_eq!(config.bridge.push_idle_timeout_secs, 120);
        assert!(!config.events.json);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("daemon.toml");

        let mut config = Config::default();
        config.bridge.program = "/opt/platform-tools/adb".to_string();
        config.bridge.push_idle_timeout_secs = 45;
        config.staging.dir = dir.path().join("staging");
        config.events.json = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.bridge.program, "/opt/platform-tools/adb");
        assert_eq!(loaded.push_idle_timeout(), Duration::from_secs(45));
        assert_eq!(loaded.staging.dir, dir.path().join("staging"));
        assert!(loaded.events.json);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[staging]\ndir = \"/srv/staging\"\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.staging.dir, PathBuf::from("/srv/staging"));
        assert_eq!(loaded.bridge.program, "adb");
        assert_eq!(loaded.bridge.push_idle_timeout_secs, 120);
    }

    #[test]
    fn test_ensure_directories_creates_staging_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.staging.dir = dir.path().join("incoming");
        config.ensure_directories().unwrap();
        assert!(config.staging.dir.is_dir());
    }
}
