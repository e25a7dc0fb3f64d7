use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::database::{IsolationLevel, StoreConfig};

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Paths {
    pub database_file: String,
    pub log_directory: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            database_file: "./data/events.sqlite".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RaceConfig {
    /// Number of racing writers; they submit versions 1..=writers
    pub writers: usize,
    pub name: String,
    pub isolation: IsolationLevel,
    pub pre_race_delay_ms: u64,
    /// Worker pool size, one per writer when unset
    pub workers: Option<usize>,
    pub seed: Option<u64>,
    /// Versions whose commit is forced to fail
    pub fail_commit_versions: Vec<i64>,
    /// Leave the event table in place after the run
    pub keep_table: bool,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            writers: 5,
            name: "First event".to_string(),
            isolation: IsolationLevel::ReadCommitted,
            pre_race_delay_ms: 200,
            workers: None,
            seed: None,
            fail_commit_versions: Vec::new(),
            keep_table: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    /// "json" or "line"
    pub log_format: String,
    pub log_to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Paths,
    pub store: StoreConfig,
    pub race: RaceConfig,
    pub logging: Logging,
}

impl AppConfig {
    // Load config from a TOML file, falling back to defaults when it is missing
    pub fn load(config_path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_path = config_path.as_ref();

        if !config_path.exists() {
            warn!("Config file not found: {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded config from {}", config_path.display());
        Ok(config)
    }

    // Write the default config as pretty TOML, creating parent directories
    pub fn write_default(config_path: impl AsRef<Path>) -> ConfigResult<()> {
        let config_path = config_path.as_ref();

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(config_path, content)?;

        info!("Created default config file: {}", config_path.display());
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.race.writers == 0 {
            return Err(ConfigError::Invalid("race.writers must be > 0".to_string()));
        }
        if self.race.workers == Some(0) {
            return Err(ConfigError::Invalid("race.workers must be > 0 when set".to_string()));
        }
        if self.paths.database_file.trim().is_empty() {
            return Err(ConfigError::Invalid("paths.database_file must not be empty".to_string()));
        }
        match self.logging.log_format.as_str() {
            "json" | "line" => Ok(()),
            other => Err(ConfigError::Invalid(format!("unknown log_format '{}'", other))),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.database_file)
    }

    pub fn log_directory(&self) -> PathBuf {
        PathBuf::from(&self.paths.log_directory)
    }
}
