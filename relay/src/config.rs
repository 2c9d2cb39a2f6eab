//! Configuration management for the relay.

use std::env;
use std::time::Duration;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL, `None` keeps envelopes in memory
    pub database_url: Option<String>,
    /// Secret for replica bearer tokens, `None` disables authentication
    pub auth_secret: Option<String>,
    /// Identifier reported in handshakes
    pub relay_id: String,
    /// Largest pull page or push batch
    pub max_batch_size: usize,
    /// Backlog of the pushing replica above which its pushes are refused
    pub queue_depth_limit: u64,
    /// Replicas silent for longer than this no longer count towards the
    /// relay-wide queue depth
    pub replica_idle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            auth_secret: None,
            relay_id: "concord-relay".to_string(),
            max_batch_size: 500,
            queue_depth_limit: 10_000,
            replica_idle_secs: 86_400,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort)?,
            Err(_) => defaults.port,
        };

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());
        let relay_id = env::var("RELAY_ID").unwrap_or(defaults.relay_id);

        let max_batch_size = match env::var("MAX_BATCH_SIZE") {
            Ok(raw) => raw
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or(ConfigError::InvalidNumber("MAX_BATCH_SIZE"))?,
            Err(_) => defaults.max_batch_size,
        };

        let queue_depth_limit = match env::var("QUEUE_DEPTH_LIMIT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("QUEUE_DEPTH_LIMIT"))?,
            Err(_) => defaults.queue_depth_limit,
        };

        let replica_idle_secs = match env::var("REPLICA_IDLE_SECS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("REPLICA_IDLE_SECS"))?,
            Err(_) => defaults.replica_idle_secs,
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            relay_id,
            max_batch_size,
            queue_depth_limit,
            replica_idle_secs,
        })
    }

    /// Window within which a replica counts as active.
    pub fn replica_idle(&self) -> Duration {
        Duration::from_secs(self.replica_idle_secs)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),
}
