//! Gateway error types.

use std::time::Duration;

use crate::cache::CacheError;
use crate::lock::LockError;

/// Errors produced by the target connection core and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// An acquisition loop is already running for this connection.
    #[error("Acquisition loop already running for target {0}")]
    AlreadyRunning(String),

    /// The subscription request template cannot be turned into a query.
    #[error("Invalid subscribe request: {0}")]
    InvalidRequest(String),

    /// The query built for a target failed validation.
    #[error("Invalid query for target {target}: {reason}")]
    InvalidQuery {
        /// Target name.
        target: String,
        /// Why validation failed.
        reason: String,
    },

    /// Dialing the target failed.
    #[error("Dial failed for target {target}: {reason}")]
    Dial {
        /// Target name.
        target: String,
        /// Failure reported by the transport.
        reason: String,
    },

    /// Dialing the target did not complete in time.
    #[error("Dial to target {target} timed out after {timeout:?}")]
    DialTimeout {
        /// Target name.
        target: String,
        /// Configured dial timeout.
        timeout: Duration,
    },

    /// The established subscription failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer sent an explicit error response.
    #[error("Error in response from {target}: {message}")]
    PeerError {
        /// Target name.
        target: String,
        /// Error text sent by the peer.
        message: String,
    },

    /// The peer sent a response with no recognizable payload.
    #[error("Unrecognized response from {0}")]
    UnrecognizedResponse(String),

    /// The cache sink refused an update.
    #[error("Target cache update error: {0}")]
    Cache(#[from] CacheError),

    /// Lock backend failure.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Errors that end only the current subscription attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyRunning(_) | Self::Config(_) | Self::Io(_) | Self::Toml(_) | Self::Json(_)
        )
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
