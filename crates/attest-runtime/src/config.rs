//! Runtime configuration.
//!
//! ```yaml
//! audit_dir: /var/lib/attest/audit
//! concurrent_layers: true
//! signing_key_env: ATTEST_AUDIT_KEY
//! retry:
//!   max_attempts: 3
//!   initial_backoff: 50ms
//!   max_backoff: 2s
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the audit signing key by default.
pub const DEFAULT_SIGNING_KEY_ENV: &str = "ATTEST_AUDIT_KEY";

/// Errors from loading runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Retry policy for the audit-store append.
///
/// Retries happen only around the store write; the verification itself is
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: usize,

    #[serde(with = "duration_human")]
    pub initial_backoff: Duration,

    #[serde(with = "duration_human")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Configuration for [`crate::VerificationRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory of the file audit store; no store when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_dir: Option<PathBuf>,

    /// Run the four layers on separate blocking tasks
    pub concurrent_layers: bool,

    /// Environment variable to read the signing key from
    pub signing_key_env: String,

    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            audit_dir: None,
            concurrent_layers: true,
            signing_key_env: DEFAULT_SIGNING_KEY_ENV.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff exceeds retry.max_backoff".to_string(),
            ));
        }
        if self.signing_key_env.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "signing_key_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durations as human-readable strings (`"50ms"`, `"2s"`).
mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
