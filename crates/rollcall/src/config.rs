//! Configuration management for rollcall.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{ChildStatus, RecordDefaults, DEFAULT_ETA, DEFAULT_PHOTO_URL};
use crate::registry::RegistrySettings;
use crate::store::TreePath;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "rollcall";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "tree.db";

/// Default object directory name.
const OBJECTS_DIR_NAME: &str = "objects";

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "ROLLCALL_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `ROLLCALL_`, sections separated
///    by `__`, e.g. `ROLLCALL_SYNC__SETTLING_DELAY_MS=250`)
/// 2. TOML config file at `~/.config/rollcall/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tree store configuration.
    pub store: StoreConfig,
    /// Object store configuration.
    pub objects: ObjectsConfig,
    /// Values for new records.
    pub defaults: DefaultsConfig,
    /// Reconciliation configuration.
    pub sync: SyncConfig,
}

/// Tree store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/rollcall/tree.db`
    pub database_path: Option<PathBuf>,
    /// Path of the record collection inside the tree.
    pub root: String,
}

/// Object store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectsConfig {
    /// Directory holding one sub-directory per bucket.
    /// Defaults to `~/.local/share/rollcall/objects`
    pub objects_dir: Option<PathBuf>,
    /// Image shown for children without a usable photo.
    pub default_photo_url: String,
}

/// Values written into new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Initial ETA text.
    pub eta: String,
    /// Initial status.
    pub status: String,
}

/// Reconciliation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait between copying a renamed record and deleting its old key.
    pub settling_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            root: "children".to_string(),
        }
    }
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            objects_dir: None,
            default_photo_url: DEFAULT_PHOTO_URL.to_string(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            eta: DEFAULT_ETA.to_string(),
            status: ChildStatus::OnRoute.to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settling_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `ROLLCALL_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let root = self.root_path()?;
        if root.is_root() {
            return Err(Error::InvalidConfig(
                "store.root must name a collection, not the tree root".to_string(),
            ));
        }

        if self.objects.default_photo_url.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "objects.default_photo_url cannot be empty".to_string(),
            ));
        }

        if self.defaults.status.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "defaults.status cannot be empty".to_string(),
            ));
        }

        if self.sync.settling_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "sync.settling_delay_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse the configured collection path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has invalid segments.
    pub fn root_path(&self) -> Result<TreePath> {
        TreePath::parse(&self.store.root)
            .map_err(|e| Error::InvalidConfig(format!("store.root: {e}")))
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the objects directory, resolving defaults if not set.
    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.objects
            .objects_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(OBJECTS_DIR_NAME))
    }

    /// Get the settling delay as a Duration.
    #[must_use]
    pub fn settling_delay(&self) -> Duration {
        Duration::from_millis(self.sync.settling_delay_ms)
    }

    /// Values written into new records.
    #[must_use]
    pub fn record_defaults(&self) -> RecordDefaults {
        RecordDefaults {
            eta: self.defaults.eta.clone(),
            status: ChildStatus::from(self.defaults.status.clone()),
            photo_url: self.objects.default_photo_url.clone(),
        }
    }

    /// Settings for a registry session.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection path is invalid.
    pub fn registry_settings(&self) -> Result<RegistrySettings> {
        Ok(RegistrySettings {
            root: self.root_path()?,
            defaults: self.record_defaults(),
            settling_delay: self.settling_delay(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.store.root, "children");
        assert_eq!(config.defaults.eta, "Arriving in 5 minutes");
        assert_eq!(config.defaults.status, "On Route");
        assert_eq!(config.sync.settling_delay_ms, 1000);
        assert!(!config.objects.default_photo_url.is_empty());
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_root_is_tree_root() {
        let mut config = Config::default();
        config.store.root = "/".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("store.root"));
    }

    #[test]
    fn test_validate_invalid_root() {
        let mut config = Config::default();
        config.store.root = "children/$bad".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("store.root"));
    }

    #[test]
    fn test_validate_empty_photo_url() {
        let mut config = Config::default();
        config.objects.default_photo_url = "  ".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("default_photo_url"));
    }

    #[test]
    fn test_validate_empty_status() {
        let mut config = Config::default();
        config.defaults.status = String::new();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("defaults.status"));
    }

    #[test]
    fn test_validate_zero_settling_delay() {
        let mut config = Config::default();
        config.sync.settling_delay_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("settling_delay_ms"));
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        assert!(config.database_path().to_string_lossy().contains("tree.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.store.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_objects_dir_default() {
        let config = Config::default();
        assert!(config.objects_dir().ends_with("objects"));
    }

    #[test]
    fn test_settling_delay() {
        let config = Config::default();
        assert_eq!(config.settling_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_record_defaults() {
        let mut config = Config::default();
        config.defaults.status = "Waiting".to_string();

        let defaults = config.record_defaults();
        assert_eq!(defaults.status, ChildStatus::Waiting);
        assert_eq!(defaults.photo_url, config.objects.default_photo_url);
    }

    #[test]
    fn test_registry_settings() {
        let mut config = Config::default();
        config.store.root = "routes/42/children".to_string();
        config.sync.settling_delay_ms = 250;

        let settings = config.registry_settings().unwrap();
        assert_eq!(settings.root.as_key(), "routes/42/children");
        assert_eq!(settings.settling_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("rollcall"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_default_data_dir() {
        let path = Config::default_data_dir();
        assert!(path.to_string_lossy().contains("rollcall"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        // Loading from a nonexistent path should work (uses defaults)
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
    }

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_from_file() {
        let path = write_config(
            "sections.toml",
            r#"
[store]
root = "routes/7/children"

[sync]
settling_delay_ms = 50
"#,
        );

        let config = Config::load_from(Some(path.clone())).unwrap();
        assert_eq!(config.store.root, "routes/7/children");
        assert_eq!(config.sync.settling_delay_ms, 50);
        assert_eq!(config.defaults, DefaultsConfig::default());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let path = write_config("invalid.toml", "[sync]\nsettling_delay_ms = 0\n");

        let result = Config::load_from(Some(path.clone()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let path = write_config("malformed.toml", "[sync\nsettling_delay_ms = \"soon\"\n");

        let result = Config::load_from(Some(path.clone()));
        assert!(matches!(result, Err(Error::Config(_))));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_sync_config_deserialize() {
        let json = r#"{"settling_delay_ms": 10}"#;
        let sync: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(sync.settling_delay_ms, 10);
    }

    #[test]
    fn test_config_clone() {
        let config = Config::default();
        let cloned = config.clone();
        assert_eq!(config, cloned);
    }
}
