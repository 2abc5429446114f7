//! Configuration management
//!
//! This module handles loading, validation, and management of the Recall configuration.
//! Configuration is stored in TOML format at ~/.recall/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **store**: SQLite file name, pool size, per-call timeout
//! - **compaction**: Size threshold, retention floor, summarizer timeout
//! - **day_window**: Reference timezone for the daily conversation boundary
//! - **modality**: Presence liveness window
//! - **prompt**: Optional display caps for rendered prompts
//!
//! Every section except `core` may be omitted and falls back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use recall_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Database: {:?}", config.database_path());
//! println!("Retention floor: {}", config.compaction.retention_floor);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compaction::{CompactionPolicy, DEFAULT_RETENTION_FLOOR, DEFAULT_SIZE_THRESHOLD};
use crate::day_window::DayWindowResolver;
use crate::memory::prompt::PromptLimits;
use crate::modality::DEFAULT_PRESENCE_TTL_SECS;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Durable store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Compaction tunables
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Day boundary settings
    #[serde(default)]
    pub day_window: DayWindowConfig,

    /// Presence register settings
    #[serde(default)]
    pub modality: ModalityConfig,

    /// Prompt rendering caps
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file name, relative to `core.data_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Timeout applied to every store call (seconds)
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            timeout_secs: default_store_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Character budget for unsummarized turns
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,

    /// Most-recent turns always kept verbatim
    #[serde(default = "default_retention_floor")]
    pub retention_floor: usize,

    /// Timeout for a single summarizer call (seconds)
    #[serde(default = "default_summarizer_timeout")]
    pub summarizer_timeout_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            size_threshold: default_size_threshold(),
            retention_floor: default_retention_floor(),
            summarizer_timeout_secs: default_summarizer_timeout(),
        }
    }
}

/// Day boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayWindowConfig {
    /// IANA timezone used to decide when a new conversation day starts
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for DayWindowConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

/// Presence register configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalityConfig {
    /// How long a modality entry counts as live after its last activity (seconds)
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_secs: u64,
}

impl Default for ModalityConfig {
    fn default() -> Self {
        Self {
            presence_ttl_secs: default_presence_ttl(),
        }
    }
}

/// Prompt rendering caps. Unset means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Keep at most this many trailing characters of the summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_summary_chars: Option<usize>,

    /// Keep at most this many trailing characters of the recent-turns listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns_chars: Option<usize>,

    /// Keep at most this many trailing characters of the whole prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_chars: Option<usize>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.recall")
}

fn default_database_file() -> String {
    "recall.db".to_string()
}

fn default_store_timeout() -> u64 {
    5
}

fn default_max_connections() -> u32 {
    5
}

fn default_size_threshold() -> usize {
    DEFAULT_SIZE_THRESHOLD
}

fn default_retention_floor() -> usize {
    DEFAULT_RETENTION_FLOOR
}

fn default_summarizer_timeout() -> u64 {
    30
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_presence_ttl() -> u64 {
    DEFAULT_PRESENCE_TTL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            store: StoreConfig::default(),
            compaction: CompactionConfig::default(),
            day_window: DayWindowConfig::default(),
            modality: ModalityConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.recall/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();

        // Serialize before path expansion so the file keeps the portable ~ form
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.recall/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".recall").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, thresholds and timeouts
    /// - Verifies the reference timezone exists
    /// - Expands ~ in the data directory and creates it
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.compaction.size_threshold == 0 {
            return Err(EngineError::Config(
                "size_threshold must be greater than 0".to_string(),
            ));
        }
        if self.compaction.retention_floor == 0 {
            return Err(EngineError::Config(
                "retention_floor must be at least 1".to_string(),
            ));
        }
        if self.compaction.summarizer_timeout_secs == 0 {
            return Err(EngineError::Config(
                "summarizer_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.store.timeout_secs == 0 {
            return Err(EngineError::Config(
                "store timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(EngineError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.store.database_file.trim().is_empty() {
            return Err(EngineError::Config(
                "database_file must not be empty".to_string(),
            ));
        }

        if presence_ttl_from_secs(self.modality.presence_ttl_secs).is_none() {
            return Err(EngineError::Config(format!(
                "presence_ttl_secs {} is out of range",
                self.modality.presence_ttl_secs
            )));
        }

        // Unknown timezone names fail at load time
        DayWindowResolver::from_name(&self.day_window.timezone)?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    /// Full path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join(&self.store.database_file)
    }

    pub fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy::new(
            self.compaction.size_threshold,
            self.compaction.retention_floor,
        )
    }

    /// Resolver for the configured reference timezone
    pub fn day_window(&self) -> Result<DayWindowResolver, EngineError> {
        DayWindowResolver::from_name(&self.day_window.timezone)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.compaction.summarizer_timeout_secs)
    }

    /// Liveness window for the modality register
    ///
    /// Falls back to two hours when the field was set out of range after
    /// loading.
    pub fn presence_ttl(&self) -> chrono::Duration {
        presence_ttl_from_secs(self.modality.presence_ttl_secs)
            .unwrap_or_else(|| chrono::Duration::hours(2))
    }

    pub fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            max_summary_chars: self.prompt.max_summary_chars,
            max_turns_chars: self.prompt.max_turns_chars,
            max_total_chars: self.prompt.max_total_chars,
        }
    }
}

fn presence_ttl_from_secs(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
