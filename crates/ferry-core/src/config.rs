//! Transfer configuration and orchestrator settings
//!
//! [`TransferConfig`] holds the user's transfer defaults. It only reaches the
//! orchestrator as a [`ValidatedConfig`], which can be obtained exclusively
//! through [`TransferConfig::validate`].

use crate::retry::RetryConfig;
use crate::storage::{CONFIG_KEY, Storage};
use crate::transfer::{Protocol, TransferMode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest accepted chunk size (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest accepted timeout in seconds
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Largest accepted retry budget
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Port outside `[1, 65535]`
    #[error("Invalid port number: {0}. Must be greater than 0")]
    InvalidPort(u16),

    /// Chunk size outside `(0, 1 MiB]`
    #[error("Chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes (got {0})")]
    InvalidChunkSize(usize),

    /// Timeout outside `(0, 3600]` seconds
    #[error("Timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds (got {0})")]
    InvalidTimeout(u64),

    /// Retry budget above the maximum
    #[error("Retry attempts must not exceed {MAX_RETRY_ATTEMPTS} (got {0})")]
    TooManyRetries(u32),

    /// Transmitter mode without a target address
    #[error("Target IP address is required for transmitter mode")]
    MissingTarget,

    /// Target is not an IP address or `localhost`
    #[error("Invalid IP address format: {0}")]
    InvalidTarget(Cow<'static, str>),
}

impl From<ConfigError> for crate::error::OrchestratorError {
    fn from(err: ConfigError) -> Self {
        crate::error::OrchestratorError::InvalidConfig(Cow::Owned(err.to_string()))
    }
}

/// Returns true for IPv4, IPv6 or `localhost`
#[must_use]
pub fn is_valid_ip_address(ip: &str) -> bool {
    let ip = ip.trim();
    ip.eq_ignore_ascii_case("localhost") || ip.parse::<IpAddr>().is_ok()
}

/// Transfer defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Local role
    #[serde(default)]
    pub mode: TransferMode,

    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Remote address, required when transmitting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ip: Option<String>,

    /// Port to connect to or listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Operation timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// File to send, or name to save as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Attempt budget for automatic retries
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Whether failed transfers are retried automatically
    #[serde(default = "default_true")]
    pub auto_retry_enabled: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_chunk_size() -> usize {
    8192
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::Transmitter,
            protocol: Protocol::Tcp,
            target_ip: None,
            port: default_port(),
            chunk_size: default_chunk_size(),
            timeout: default_timeout(),
            filename: None,
            retry_attempts: default_retry_attempts(),
            auto_retry_enabled: true,
        }
    }
}

impl TransferConfig {
    /// Check every field and produce a [`ValidatedConfig`]
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        self.check()?;
        Ok(ValidatedConfig(self))
    }

    /// Check every field without consuming the config
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }

        if self.timeout == 0 || self.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }

        if self.retry_attempts > MAX_RETRY_ATTEMPTS {
            return Err(ConfigError::TooManyRetries(self.retry_attempts));
        }

        if self.mode == TransferMode::Transmitter {
            let target = self
                .target_ip
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(ConfigError::MissingTarget)?;

            if !is_valid_ip_address(target) {
                return Err(ConfigError::InvalidTarget(Cow::Owned(target.to_string())));
            }
        }

        Ok(())
    }

    /// Operation timeout
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A [`TransferConfig`] that passed validation
///
/// The only way to start a transfer; the field is private so that an
/// unvalidated config cannot be smuggled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedConfig(TransferConfig);

impl ValidatedConfig {
    /// Underlying configuration
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.0
    }

    /// Give back the underlying configuration
    #[must_use]
    pub fn into_inner(self) -> TransferConfig {
        self.0
    }

    /// Attempt budget for automatic retries, `None` when disabled
    #[must_use]
    pub fn retry_budget(&self) -> Option<u32> {
        (self.0.auto_retry_enabled && self.0.retry_attempts > 0).then_some(self.0.retry_attempts)
    }
}

impl Deref for ValidatedConfig {
    type Target = TransferConfig;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Persisted transfer defaults
///
/// Reads fall back to defaults on a missing or unparsable value; updates are
/// validated before they are persisted.
#[derive(Debug)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    current: TransferConfig,
}

impl ConfigStore {
    /// Load the persisted configuration, falling back to defaults
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let current = match storage.get(CONFIG_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<TransferConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Stored transfer config is unreadable, using defaults: {}", e);
                    TransferConfig::default()
                }
            },
            Ok(None) => {
                debug!("No stored transfer config, using defaults");
                TransferConfig::default()
            }
            Err(e) => {
                warn!("Failed to read transfer config, using defaults: {}", e);
                TransferConfig::default()
            }
        };

        Self { storage, current }
    }

    /// Current (possibly unvalidated) configuration
    #[must_use]
    pub fn current(&self) -> &TransferConfig {
        &self.current
    }

    /// Validate the current configuration
    pub fn validated(&self) -> Result<ValidatedConfig, ConfigError> {
        self.current.clone().validate()
    }

    /// Validate, store and persist a new configuration
    ///
    /// Persistence failures are logged; the in-memory value is still updated.
    pub fn update(&mut self, config: TransferConfig) -> Result<ValidatedConfig, ConfigError> {
        let validated = config.validate()?;
        self.current = validated.config().clone();
        self.persist();
        Ok(validated)
    }

    /// Restore defaults and persist them
    pub fn reset(&mut self) {
        self.current = TransferConfig::default();
        self.persist();
    }

    fn persist(&self) {
        let raw = match serde_json::to_string(&self.current) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize transfer config: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.set(CONFIG_KEY, &raw) {
            warn!("Failed to persist transfer config: {}", e);
        }
    }
}

/// Tunables of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Delay before a completed snapshot is cleared
    pub completed_clear_delay: Duration,

    /// Delay before a cancelled snapshot is cleared
    pub cancelled_clear_delay: Duration,

    /// Maximum number of visible notifications
    pub notification_cap: usize,

    /// Auto-dismiss delay for non-persistent notifications
    pub notification_duration: Duration,

    /// Backoff used for automatic transfer retries
    pub retry: RetryConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            completed_clear_delay: Duration::from_millis(3000),
            cancelled_clear_delay: Duration::from_millis(2000),
            notification_cap: 5,
            notification_duration: Duration::from_millis(5000),
            retry: RetryConfig::default(),
        }
    }
}
