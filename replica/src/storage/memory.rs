//! In-memory document store for tests and ephemeral replicas.

use super::DocumentStore;
use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

/// Document store backed by nested `BTreeMap`s.
///
/// Supports fault injection so persistence failure paths can be exercised:
/// [`fail_next_writes`](Self::fail_next_writes) fails a number of upcoming
/// writes, [`fail_key`](Self::fail_key) fails every write to one key until
/// [`heal_key`](Self::heal_key).
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    transient_failures: AtomicU32,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a persistence error.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every write to `namespace/key`.
    pub fn fail_key(&self, namespace: &str, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(format!("{namespace}/{key}"));
        }
    }

    pub fn heal_key(&self, namespace: &str, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.remove(&format!("{namespace}/{key}"));
        }
    }

    fn check_write(&self, namespace: &str, key: &str) -> Result<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let blocked = self
            .failing_keys
            .lock()
            .map(|keys| keys.contains(&format!("{namespace}/{key}")))
            .unwrap_or(false);

        if injected || blocked {
            return Err(ReplicaError::persistence(
                &format!("put {namespace}/{key}"),
                "injected write failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_write(namespace, key)?;
        self.namespaces
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.check_write(namespace, key)?;
        if let Some(entries) = self.namespaces.write().await.get_mut(namespace) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn scan_after(
        &self,
        namespace: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let guard = self.namespaces.read().await;
        let Some(entries) = guard.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|(key, _)| after.map_or(true, |after| key.as_str() > after))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        Ok(self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map_or(0, |entries| entries.len()))
    }
}
