//! Entity persistence and the per-entity apply lock.

use super::{get_json, ns, put_json, scan_json, DocumentStore, RetryPolicy};
use crate::error::Result;
use concord_engine::{EntityId, EntityVersion};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Holds one entity's apply lock. Dropping the last holder removes the
/// entity from the lock table.
pub struct EntityGuard<'a> {
    locks: &'a DashMap<EntityId, Arc<Mutex<()>>>,
    entity_id: EntityId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so their entry survives
        self.locks
            .remove_if(&self.entity_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Typed view over the `entities` namespace.
///
/// Applying a merge result is a read-merge-write sequence; callers hold the
/// entity's lock from [`lock`](Self::lock) across it so two batches never
/// merge into the same entity at once.
pub struct EntityStore {
    docs: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl EntityStore {
    pub fn new(docs: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self {
            docs,
            retry,
            locks: DashMap::new(),
        }
    }

    /// Acquire the apply lock of one entity.
    pub async fn lock(&self, entity_id: &str) -> EntityGuard<'_> {
        let mutex = self
            .locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        EntityGuard {
            locks: &self.locks,
            entity_id: entity_id.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<EntityVersion>> {
        get_json(self.docs.as_ref(), ns::ENTITIES, entity_id).await
    }

    /// Persist an entity, retrying transient failures.
    pub async fn put(&self, entity: &EntityVersion) -> Result<()> {
        put_json(
            self.docs.as_ref(),
            self.retry,
            ns::ENTITIES,
            &entity.entity_id,
            entity,
        )
        .await
    }

    /// Every stored entity, tombstoned ones included, ordered by id.
    pub async fn all(&self) -> Result<Vec<EntityVersion>> {
        scan_json(self.docs.as_ref(), ns::ENTITIES).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.docs.count(ns::ENTITIES).await
    }
}
