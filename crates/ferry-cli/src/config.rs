//! Configuration system for the Ferry CLI.

use ferry_core::{OrchestratorSettings, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ferry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where history and transfer settings are persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Automatic retry backoff
    #[serde(default)]
    pub retry: RetrySection,
    /// Notification and snapshot display timing
    #[serde(default)]
    pub presentation: PresentationConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `<key>.json` files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Randomize delays by +/- `jitter_ratio`
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Jitter magnitude
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

/// Presentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationConfig {
    /// Maximum visible notifications
    #[serde(default = "default_notification_cap")]
    pub notification_cap: usize,
    /// Auto-dismiss delay, in milliseconds
    #[serde(default = "default_notification_duration_ms")]
    pub notification_duration_ms: u64,
    /// How long a completed transfer stays visible, in milliseconds
    #[serde(default = "default_completed_clear_ms")]
    pub completed_clear_delay_ms: u64,
    /// How long a cancelled transfer stays visible, in milliseconds
    #[serde(default = "default_cancelled_clear_ms")]
    pub cancelled_clear_delay_ms: u64,
    /// Colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default values

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ferry")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_jitter_ratio() -> f64 {
    0.25
}

fn default_notification_cap() -> usize {
    5
}

fn default_notification_duration_ms() -> u64 {
    5000
}

fn default_completed_clear_ms() -> u64 {
    3000
}

fn default_cancelled_clear_ms() -> u64 {
    2000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            jitter: true,
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            notification_cap: default_notification_cap(),
            notification_duration_ms: default_notification_duration_ms(),
            completed_clear_delay_ms: default_completed_clear_ms(),
            cancelled_clear_delay_ms: default_cancelled_clear_ms(),
            color: true,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ferry/config.toml")
    }

    /// Load config from `path`, falling back to defaults when it is missing
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            anyhow::bail!("Storage data_dir must not be empty");
        }

        if self.retry.initial_delay_ms == 0 || self.retry.initial_delay_ms > 30_000 {
            anyhow::bail!("Retry initial_delay_ms must be between 1 and 30000");
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            anyhow::bail!("Retry jitter_ratio must be between 0 and 1");
        }

        if self.presentation.notification_cap == 0 || self.presentation.notification_cap > 100 {
            anyhow::bail!("Notification cap must be between 1 and 100");
        }

        Ok(())
    }

    /// Settings handed to the orchestrator
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let presentation = &self.presentation;
        OrchestratorSettings {
            completed_clear_delay: Duration::from_millis(presentation.completed_clear_delay_ms),
            cancelled_clear_delay: Duration::from_millis(presentation.cancelled_clear_delay_ms),
            notification_cap: presentation.notification_cap,
            notification_duration: Duration::from_millis(presentation.notification_duration_ms),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                jitter: self.retry.jitter,
                jitter_ratio: self.retry.jitter_ratio,
                ..RetryConfig::default()
            },
        }
    }
}
