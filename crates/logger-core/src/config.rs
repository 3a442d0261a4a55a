//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/logger/config.toml)
//! 3. Environment variables (LOGGER_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "LOGGER";

/// Folder holding photo blobs, both in the documents and cache directories
const PHOTOS_FOLDER: &str = "Photos";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Documents directory (database file, photos)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Cache directory (staged photos of deleted entries, suspend snapshot)
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// File name of the entry database inside `data_dir`
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Whether the database lives in a synced cloud container
    #[serde(default)]
    pub cloud_enabled: bool,

    /// Synced container directory used when `cloud_enabled` is set
    #[serde(default)]
    pub cloud_container: Option<PathBuf>,

    /// Byte budget for the in-memory image cache
    #[serde(default = "default_image_cache_bytes")]
    pub image_cache_bytes: usize,

    /// Timeout for a single network image fetch
    #[serde(default = "default_image_fetch_timeout_secs")]
    pub image_fetch_timeout_secs: u64,

    /// Number of deletions that can be undone
    #[serde(default = "default_undo_capacity")]
    pub undo_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_dir: default_cache_dir(),
            database_name: default_database_name(),
            cloud_enabled: false,
            cloud_container: None,
            image_cache_bytes: default_image_cache_bytes(),
            image_fetch_timeout_secs: default_image_fetch_timeout_secs(),
            undo_capacity: default_undo_capacity(),
        }
    }
}

impl Config {
    /// Config rooted at a single directory, used by tests and embedders
    /// that manage their own storage location.
    pub fn with_root(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
            ..Self::default()
        }
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LOGGER_DATA_DIR, LOGGER_CACHE_DIR, LOGGER_CLOUD_ENABLED, ...)
    /// 2. Config file (~/.config/logger/config.toml or LOGGER_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_dirs()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CACHE_DIR", ENV_PREFIX)) {
            self.cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CLOUD_ENABLED", ENV_PREFIX)) {
            self.cloud_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // Empty string clears the container
        if let Ok(val) = std::env::var(format!("{}_CLOUD_CONTAINER", ENV_PREFIX)) {
            self.cloud_container = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var(format!("{}_IMAGE_CACHE_BYTES", ENV_PREFIX)) {
            if let Ok(bytes) = val.parse() {
                self.image_cache_bytes = bytes;
            }
        }
    }

    /// Ensure the data, cache and photo directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.cache_dir.clone(),
            self.photos_dir(),
            self.photos_cache_dir(),
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {:?}", dir))?;
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LOGGER_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("logger")
            .join("config.toml")
    }

    /// Path of the local entry database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_name)
    }

    /// Path of the entry database inside the cloud container, if one is configured
    pub fn cloud_database_path(&self) -> Option<PathBuf> {
        self.cloud_container
            .as_ref()
            .map(|container| container.join("Documents").join(&self.database_name))
    }

    /// Directory holding photos referenced by entries
    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join(PHOTOS_FOLDER)
    }

    /// Staging directory for photos of soft-deleted entries
    pub fn photos_cache_dir(&self) -> PathBuf {
        self.cache_dir.join(PHOTOS_FOLDER)
    }

    /// Path of the JSON snapshot written on suspend
    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join("snapshot.json")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logger")
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("logger")
}

fn default_database_name() -> String {
    "data.logger".to_string()
}

fn default_image_cache_bytes() -> usize {
    250 * 1024 * 1024
}

fn default_image_fetch_timeout_secs() -> u64 {
    10
}

fn default_undo_capacity() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "LOGGER_DATA_DIR",
        "LOGGER_CACHE_DIR",
        "LOGGER_CLOUD_ENABLED",
        "LOGGER_CLOUD_CONTAINER",
        "LOGGER_IMAGE_CACHE_BYTES",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.cloud_enabled);
        assert!(config.cloud_container.is_none());
        assert!(config.data_dir.ends_with("logger"));
        assert_eq!(config.database_name, "data.logger");
        assert_eq!(config.undo_capacity, 20);
    }

    #[test]
    fn test_file_paths() {
        let config = Config::with_root(Path::new("/tmp/logger-root"));

        assert!(config.database_path().ends_with("data/data.logger"));
        assert!(config.photos_dir().ends_with("data/Photos"));
        assert!(config.photos_cache_dir().ends_with("cache/Photos"));
        assert!(config.snapshot_path().ends_with("cache/snapshot.json"));
        assert!(config.cloud_database_path().is_none());
    }

    #[test]
    fn test_cloud_database_path() {
        let mut config = Config::default();
        config.cloud_container = Some(PathBuf::from("/icloud/logger"));

        assert_eq!(
            config.cloud_database_path(),
            Some(PathBuf::from("/icloud/logger/Documents/data.logger"))
        );
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LOGGER_DATA_DIR", "/tmp/logger-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/logger-test"));
    }

    #[test]
    fn test_env_override_cloud_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(!config.cloud_enabled);

        env::set_var("LOGGER_CLOUD_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.cloud_enabled);

        env::set_var("LOGGER_CLOUD_ENABLED", "1");
        config.cloud_enabled = false;
        config.apply_env_overrides();
        assert!(config.cloud_enabled);

        env::set_var("LOGGER_CLOUD_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.cloud_enabled);
    }

    #[test]
    fn test_env_override_cloud_container() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LOGGER_CLOUD_CONTAINER", "/icloud/logger");
        config.apply_env_overrides();
        assert_eq!(config.cloud_container, Some(PathBuf::from("/icloud/logger")));

        // Empty string clears it
        env::set_var("LOGGER_CLOUD_CONTAINER", "");
        config.apply_env_overrides();
        assert!(config.cloud_container.is_none());
    }

    #[test]
    fn test_env_override_ignores_bad_cache_size() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("LOGGER_IMAGE_CACHE_BYTES", "lots");
        config.apply_env_overrides();
        assert_eq!(config.image_cache_bytes, default_image_cache_bytes());

        env::set_var("LOGGER_IMAGE_CACHE_BYTES", "1024");
        config.apply_env_overrides();
        assert_eq!(config.image_cache_bytes, 1024);
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/logger"),
            cloud_enabled: true,
            cloud_container: Some(PathBuf::from("/icloud/logger")),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("cloud_container"));
        assert!(toml_str.contains("undo_capacity"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.cloud_container, config.cloud_container);
        assert_eq!(parsed.cloud_enabled, config.cloud_enabled);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            database_name = "logger.db"
            undo_capacity = 3
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.database_path(), PathBuf::from("/custom/data/logger.db"));
        assert_eq!(config.undo_capacity, 3);
        assert_eq!(config.image_fetch_timeout_secs, 10);
    }

    #[test]
    fn test_load_from_path_missing_file_creates_dirs() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();

        env::set_var("LOGGER_DATA_DIR", temp_dir.path().join("docs"));
        env::set_var("LOGGER_CACHE_DIR", temp_dir.path().join("cache"));

        let config = Config::load_from_path(&temp_dir.path().join("missing.toml")).unwrap();
        assert!(!config.cloud_enabled);
        assert!(config.photos_dir().is_dir());
        assert!(config.photos_cache_dir().is_dir());
    }
}
