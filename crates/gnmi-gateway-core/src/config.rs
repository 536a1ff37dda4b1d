//! Gateway configuration.
//!
//! Read from a TOML file. Every field has a default, so an empty file is a
//! valid configuration:
//!
//! ```toml
//! target_dial_timeout_ms = 10000
//! target_limit = 100
//! lock_retry_interval_ms = 50
//! insecure_skip_verify = true
//! rejection_scope = "update"
//! shutdown_grace_ms = 5000
//!
//! [lock]
//! backend = "file"
//! dir = "/var/run/gnmi-gateway/locks"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSettings;
use crate::error::{GatewayError, Result};
use crate::filter::RejectionScope;
use crate::transport::TlsSettings;

/// Which backend provides per-target fleet locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// In-process only. Suitable for a single gateway instance.
    #[default]
    Local,
    /// Lock files in a directory shared by all instances.
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// Lock directory; required by the file backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upper bound on one dial, in milliseconds.
    #[serde(default = "default_target_dial_timeout_ms")]
    pub target_dial_timeout_ms: u64,

    /// Maximum number of targets connecting or connected at once.
    #[serde(default = "default_target_limit")]
    pub target_limit: usize,

    /// Pause between failed slot, lock, or dial attempts, in milliseconds.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Skip verification of target certificates.
    #[serde(default = "default_insecure_skip_verify")]
    pub insecure_skip_verify: bool,

    /// Whether a malformed path drops one update or its whole notification.
    #[serde(default)]
    pub rejection_scope: RejectionScope,

    /// How long shutdown waits for target tasks, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

const fn default_target_dial_timeout_ms() -> u64 {
    10_000
}

const fn default_target_limit() -> usize {
    100
}

const fn default_lock_retry_interval_ms() -> u64 {
    50
}

const fn default_insecure_skip_verify() -> bool {
    true
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            target_dial_timeout_ms: default_target_dial_timeout_ms(),
            target_limit: default_target_limit(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            insecure_skip_verify: default_insecure_skip_verify(),
            rejection_scope: RejectionScope::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            lock: LockConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate TOML configuration.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.target_limit == 0 {
            return Err(GatewayError::Config(
                "target_limit must be greater than 0".into(),
            ));
        }
        if self.target_dial_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "target_dial_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.lock_retry_interval_ms == 0 {
            return Err(GatewayError::Config(
                "lock_retry_interval_ms must be greater than 0".into(),
            ));
        }
        if self.lock.backend == LockBackend::File && self.lock.dir.is_none() {
            return Err(GatewayError::Config(
                "lock.dir is required for the file lock backend".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.target_dial_timeout_ms)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Per-connection settings derived from this configuration.
    #[must_use]
    pub const fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            dial_timeout: self.dial_timeout(),
            retry_interval: self.retry_interval(),
            tls: TlsSettings {
                insecure_skip_verify: self.insecure_skip_verify,
            },
            rejection_scope: self.rejection_scope,
        }
    }
}
