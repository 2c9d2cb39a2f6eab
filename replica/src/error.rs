//! Error types for the replica.
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Relay unreachable or returned a server error |
//! | `Backpressure` | Yes | Relay queue above threshold, back off |
//! | `Timeout` | Yes | Sync round exceeded its deadline |
//! | `Persistence` | No | Local write failed after bounded retries |
//! | `Engine` | No | Merge integrity or invariant failure |
//! | `NotFound` / `AlreadyResolved` | No | Conflict ledger misuse |
//! | `Crypto` | No | Payload could not be sealed or opened |
//! | `Protocol` | No | Relay answered something unexpected |
//! | `Config` | No | Configuration invalid |
//!
//! Use [`ReplicaError::is_retryable()`] to decide whether the sync driver
//! should back off and try again.

use concord_engine::ConflictId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Engine error: {0}")]
    Engine(concord_engine::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    #[error("Relay backpressure: queue depth {queue_depth}")]
    Backpressure { queue_depth: u64 },

    #[error("Persistence error ({operation}): {message}")]
    Persistence { operation: String, message: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Sync round timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReplicaError {
    /// Check if this error is transient and the round should be retried
    /// with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicaError::Transport { .. }
                | ReplicaError::Backpressure { .. }
                | ReplicaError::Timeout(_)
        )
    }

    /// Errors surfaced to the operator as actionable states rather than
    /// retried quietly.
    pub fn is_actionable(&self) -> bool {
        match self {
            ReplicaError::Engine(e) => e.is_integrity_failure(),
            ReplicaError::Persistence { .. } | ReplicaError::Transport { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn persistence(operation: &str, err: impl std::fmt::Display) -> Self {
        ReplicaError::Persistence {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        ReplicaError::Transport {
            message: err.to_string(),
            status: None,
        }
    }
}

impl From<concord_engine::Error> for ReplicaError {
    fn from(err: concord_engine::Error) -> Self {
        match err {
            concord_engine::Error::AlreadyResolved(id) => ReplicaError::AlreadyResolved(id),
            other => ReplicaError::Engine(other),
        }
    }
}

impl From<sqlx::Error> for ReplicaError {
    fn from(err: sqlx::Error) -> Self {
        ReplicaError::persistence("sqlite", err)
    }
}

impl From<reqwest::Error> for ReplicaError {
    fn from(err: reqwest::Error) -> Self {
        ReplicaError::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}
