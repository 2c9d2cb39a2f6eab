//! Replica configuration.
//!
//! Loaded from `CONCORD_*` environment variables (a `.env` file is honored)
//! or deserialized from any serde format the host application prefers.

use crate::error::{ReplicaError, Result};
use concord_engine::ReplicaId;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Knobs for the sync protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Envelopes per pull page and per push batch
    pub batch_size: usize,
    /// Idle poll interval when no local ops arrive
    pub poll_interval_ms: u64,
    /// Deadline for one full sync round
    pub round_timeout_ms: u64,
    /// First backoff delay
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_cap_ms: u64,
    /// Relay queue depth above which the replica backs off
    pub queue_depth_threshold: u64,
    /// Attempts for a local write before it fails loudly
    pub persistence_retry_limit: u32,
    /// First delay between persistence attempts
    pub persistence_retry_delay_ms: u64,
    /// Age after which conflict records are archived
    pub conflict_retention_days: u32,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 5_000,
            round_timeout_ms: 30_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
            queue_depth_threshold: 1_000,
            persistence_retry_limit: 3,
            persistence_retry_delay_ms: 10,
            conflict_retention_days: 90,
        }
    }
}

impl SyncTuning {
    /// Fast settings for tests.
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 50,
            round_timeout_ms: 2_000,
            backoff_base_ms: 10,
            backoff_cap_ms: 100,
            persistence_retry_delay_ms: 1,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn persistence_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persistence_retry_delay_ms)
    }

    /// Retention window in milliseconds.
    pub fn conflict_retention_ms(&self) -> u64 {
        u64::from(self.conflict_retention_days) * 24 * 60 * 60 * 1000
    }
}

/// Replica configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Stable id of this device
    pub replica_id: ReplicaId,
    /// Relay base URL, `None` for an offline-only replica
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Bearer token presented to the relay
    #[serde(default)]
    pub auth_token: Option<String>,
    /// SQLite file, `None` for an in-memory store
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub sync: SyncTuning,
}

impl ReplicaConfig {
    /// Minimal configuration for an offline replica.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            relay_url: None,
            auth_token: None,
            database_path: None,
            sync: SyncTuning::default(),
        }
    }

    pub fn with_relay(mut self, url: impl Into<String>, auth_token: Option<String>) -> Self {
        self.relay_url = Some(url.into());
        self.auth_token = auth_token;
        self
    }

    pub fn with_sync(mut self, sync: SyncTuning) -> Self {
        self.sync = sync;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let replica_id = env::var("CONCORD_REPLICA_ID")
            .map_err(|_| ReplicaError::Config("CONCORD_REPLICA_ID is required".into()))?;
        if replica_id.trim().is_empty() {
            return Err(ReplicaError::Config("CONCORD_REPLICA_ID is empty".into()));
        }

        let defaults = SyncTuning::default();
        let sync = SyncTuning {
            batch_size: parse_var("CONCORD_BATCH_SIZE", defaults.batch_size)?,
            poll_interval_ms: parse_var("CONCORD_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            round_timeout_ms: parse_var("CONCORD_ROUND_TIMEOUT_MS", defaults.round_timeout_ms)?,
            backoff_base_ms: parse_var("CONCORD_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_cap_ms: parse_var("CONCORD_BACKOFF_CAP_MS", defaults.backoff_cap_ms)?,
            queue_depth_threshold: parse_var(
                "CONCORD_QUEUE_DEPTH_THRESHOLD",
                defaults.queue_depth_threshold,
            )?,
            persistence_retry_limit: parse_var(
                "CONCORD_PERSISTENCE_RETRY_LIMIT",
                defaults.persistence_retry_limit,
            )?,
            persistence_retry_delay_ms: parse_var(
                "CONCORD_PERSISTENCE_RETRY_DELAY_MS",
                defaults.persistence_retry_delay_ms,
            )?,
            conflict_retention_days: parse_var(
                "CONCORD_CONFLICT_RETENTION_DAYS",
                defaults.conflict_retention_days,
            )?,
        };

        let config = Self {
            replica_id,
            relay_url: env::var("CONCORD_RELAY_URL").ok(),
            auth_token: env::var("CONCORD_AUTH_TOKEN").ok(),
            database_path: env::var("CONCORD_DATABASE_PATH").ok(),
            sync,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the sync client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            return Err(ReplicaError::Config("batch size must be positive".into()));
        }
        if self.sync.persistence_retry_limit == 0 {
            return Err(ReplicaError::Config(
                "persistence retry limit must be at least 1".into(),
            ));
        }
        if self.sync.backoff_base_ms > self.sync.backoff_cap_ms {
            return Err(ReplicaError::Config(
                "backoff base exceeds backoff cap".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ReplicaError::Config(format!("invalid {name} value: {raw}"))),
        Err(_) => Ok(default),
    }
}
