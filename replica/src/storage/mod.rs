//! Local persistence.
//!
//! The replica treats its storage engine as a namespaced key-value document
//! store. Everything the replica owns (entities, the change log, conflict
//! records, cursors, the replica clock) lives in a namespace of that store.
//!
//! Writes go through [`persist_with_retry`]: a failing write is retried a
//! bounded number of times with doubling delay, then surfaces as
//! [`ReplicaError::Persistence`] because silently losing a write is worse
//! than failing loudly.

mod entities;
mod memory;
mod sqlite;

pub use entities::{EntityGuard, EntityStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Namespaces used by the replica.
pub mod ns {
    pub const ENTITIES: &str = "entities";
    pub const OPLOG: &str = "oplog";
    pub const ACKS: &str = "acks";
    pub const CONFLICTS: &str = "conflicts";
    pub const QUARANTINE: &str = "quarantine";
    pub const CURSORS: &str = "cursors";
    pub const META: &str = "meta";
}

/// A namespaced key-value document store.
///
/// Implementations must return scanned keys in ascending byte order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Entries with keys strictly greater than `after`, ascending, at most
    /// `limit` of them.
    async fn scan_after(
        &self,
        namespace: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Every entry of a namespace, ascending.
    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.scan_after(namespace, None, usize::MAX).await
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        Ok(self.scan(namespace).await?.len())
    }
}

/// Bounded retry policy for local writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Run a persistence operation, retrying failures with doubling delay.
///
/// Only [`ReplicaError::Persistence`] is retried; anything else is returned
/// immediately.
pub async fn persist_with_retry<F, Fut, T>(
    operation_name: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.base_delay;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "Local write succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e @ ReplicaError::Persistence { .. }) if attempts < policy.attempts => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Local write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(e) => {
                if matches!(e, ReplicaError::Persistence { .. }) {
                    warn!(
                        operation = operation_name,
                        attempts, "Local write failed, retries exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Read a JSON document.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(namespace, key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ReplicaError::persistence(&format!("decode {namespace}/{key}"), e)),
        None => Ok(None),
    }
}

/// Write a JSON document with bounded retry.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    policy: RetryPolicy,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| ReplicaError::persistence(&format!("encode {namespace}/{key}"), e))?;
    persist_with_retry(namespace, policy, || store.put(namespace, key, bytes.clone())).await
}

/// Decode every document of a namespace.
pub async fn scan_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    namespace: &str,
) -> Result<Vec<T>> {
    store
        .scan(namespace)
        .await?
        .into_iter()
        .map(|(key, bytes)| {
            serde_json::from_slice(&bytes)
                .map_err(|e| ReplicaError::persistence(&format!("decode {namespace}/{key}"), e))
        })
        .collect()
}
