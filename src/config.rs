//! Bot configuration
//!
//! Loaded from an optional YAML file, then overridden from the environment.

use crate::store::{DEFAULT_BACKUP_RETENTION, StoreConfig};
use crate::sweep::{DEFAULT_RETENTION_DAYS, DEFAULT_SWEEP_INTERVAL, SweepConfig};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Config file used when `STEWARD_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/steward.yaml";

pub const CONFIG_PATH_VAR: &str = "STEWARD_CONFIG";
pub const DATA_DIR_VAR: &str = "STEWARD_DATA_DIR";
pub const BACKUP_DIR_VAR: &str = "STEWARD_BACKUP_DIR";
pub const SWEEP_INTERVAL_VAR: &str = "STEWARD_SWEEP_INTERVAL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Directory holding `<key>.json` documents
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/backups`
    pub backup_dir: Option<PathBuf>,
    pub backup_retention: usize,
    pub sweep_interval_ms: u64,
    /// Days fired records are kept; `None` disables pruning
    pub prune_after_days: Option<i64>,
    pub log_dir: PathBuf,
    /// Channel used when a reminder cannot be sent by DM and the record has
    /// no channel of its own
    pub fallback_channel_id: Option<u64>,
    pub prefix: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backup_dir: None,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            sweep_interval_ms: u64::try_from(DEFAULT_SWEEP_INTERVAL.as_millis())
                .unwrap_or(60_000),
            prune_after_days: Some(DEFAULT_RETENTION_DAYS),
            log_dir: PathBuf::from("logs"),
            fallback_channel_id: None,
            prefix: "~".to_string(),
        }
    }
}

impl BotConfig {
    /// Load from the file named by `STEWARD_CONFIG` and the process environment
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or a
    /// setting is out of range.
    pub async fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path)).await?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file; a missing file yields the defaults
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub async fn from_file(path: &Path) -> ConfigResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse YAML text
    ///
    /// # Errors
    /// Returns the parser error.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Apply environment overrides, reading variables through `lookup`
    ///
    /// # Errors
    /// `InvalidValue` if the sweep interval is not a number.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_VAR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(BACKUP_DIR_VAR) {
            self.backup_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(SWEEP_INTERVAL_VAR) {
            self.sweep_interval_ms =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        name: SWEEP_INTERVAL_VAR,
                        value,
                    })?;
        }
        Ok(())
    }

    /// Check ranges
    ///
    /// # Errors
    /// `InvalidValue` naming the first bad setting.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backup_retention == 0 {
            return Err(ConfigError::InvalidValue {
                name: "backup_retention",
                value: self.backup_retention.to_string(),
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "sweep_interval_ms",
                value: self.sweep_interval_ms.to_string(),
            });
        }
        if let Some(days) = self.prune_after_days.filter(|days| *days < 1) {
            return Err(ConfigError::InvalidValue {
                name: "prune_after_days",
                value: days.to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        let mut store = StoreConfig::new(self.data_dir.clone());
        if let Some(dir) = &self.backup_dir {
            store.backup_dir.clone_from(dir);
        }
        store.backup_retention = self.backup_retention;
        store
    }

    #[must_use]
    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
            retention: self.prune_after_days.map(chrono::Duration::days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backup_retention, 5);
        assert_eq!(config.sweep_config().interval, Duration::from_secs(60));
        assert_eq!(
            config.store_config().backup_dir,
            PathBuf::from("data").join("backups")
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config =
            BotConfig::from_yaml("backup_retention: 3\nfallback_channel_id: 99\n").unwrap();
        assert_eq!(config.backup_retention, 3);
        assert_eq!(config.fallback_channel_id, Some(99));
        assert_eq!(config.data_dir, PathBuf::from("data"));

        assert_eq!(BotConfig::from_yaml("").unwrap(), BotConfig::default());
        assert!(BotConfig::from_yaml("backup_retention: lots").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BotConfig::default();
        config
            .apply_env(env(&[
                (DATA_DIR_VAR, "/srv/steward"),
                (BACKUP_DIR_VAR, "/srv/backups"),
                (SWEEP_INTERVAL_VAR, "250"),
            ]))
            .unwrap();

        assert_eq!(config.sweep_config().interval, Duration::from_millis(250));
        let store = config.store_config();
        assert_eq!(store.data_dir, PathBuf::from("/srv/steward"));
        assert_eq!(store.backup_dir, PathBuf::from("/srv/backups"));

        let result = config.apply_env(env(&[(SWEEP_INTERVAL_VAR, "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name: SWEEP_INTERVAL_VAR, .. })
        ));
    }

    #[test]
    fn test_validation() {
        let config = BotConfig {
            backup_retention: 0,
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BotConfig {
            sweep_interval_ms: 0,
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BotConfig {
            prune_after_days: None,
            ..BotConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep_config().retention, None);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig::from_file(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config, BotConfig::default());

        let path = dir.path().join("steward.yaml");
        tokio::fs::write(&path, "data_dir: /var/lib/steward\n").await.unwrap();
        let config = BotConfig::from_file(&path).await.unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/steward"));
    }
}
