//! Append-only log of local mutations.
//!
//! The local mutation path is the only writer. Operations are keyed by their
//! ULID so a key scan returns them in append order, and they are never
//! rewritten: relay acknowledgement is recorded in a separate namespace.

use crate::error::{ReplicaError, Result};
use crate::storage::{get_json, ns, put_json, DocumentStore, RetryPolicy};
use concord_engine::{ChangeOperation, OperationId};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;
use ulid::Ulid;

const NOTIFY_CAPACITY: usize = 256;

pub struct ChangeLog {
    docs: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    last_id: Mutex<Option<Ulid>>,
    writer: tokio::sync::Mutex<()>,
    appended: broadcast::Sender<OperationId>,
}

impl ChangeLog {
    /// Open the log, resuming id allocation after the newest stored entry.
    pub async fn open(docs: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Result<Self> {
        let last_id = docs
            .scan(ns::OPLOG)
            .await?
            .last()
            .and_then(|(key, _)| Ulid::from_string(key).ok());
        let (appended, _) = broadcast::channel(NOTIFY_CAPACITY);

        Ok(Self {
            docs,
            retry,
            last_id: Mutex::new(last_id),
            writer: tokio::sync::Mutex::new(()),
            appended,
        })
    }

    /// Allocate the next operation id.
    ///
    /// Ids are strictly increasing within a replica even if the wall clock
    /// steps backwards.
    pub fn next_id(&self) -> Result<OperationId> {
        let mut last = self
            .last_id
            .lock()
            .map_err(|_| ReplicaError::persistence("allocate op id", "id allocator poisoned"))?;
        let fresh = Ulid::new();
        let next = match *last {
            Some(prev) if fresh <= prev => prev.increment().ok_or_else(|| {
                ReplicaError::persistence("allocate op id", "ULID space exhausted")
            })?,
            _ => fresh,
        };
        *last = Some(next);
        Ok(next)
    }

    /// Append a local operation. Fails loudly if it cannot be persisted.
    pub async fn append(&self, op: &ChangeOperation) -> Result<OperationId> {
        let _writer = self.writer.lock().await;
        let key = op.op_id.to_string();

        if self.docs.get(ns::OPLOG, &key).await?.is_some() {
            return Err(ReplicaError::persistence(
                "append op",
                format!("operation {key} already in the log"),
            ));
        }
        put_json(self.docs.as_ref(), self.retry, ns::OPLOG, &key, op).await?;

        debug!(op_id = %op.op_id, entity_id = %op.entity_id, "Appended local operation");
        // No receivers is fine: the feeder may not be running
        let _ = self.appended.send(op.op_id);
        Ok(op.op_id)
    }

    pub async fn get(&self, op_id: &OperationId) -> Result<Option<ChangeOperation>> {
        get_json(self.docs.as_ref(), ns::OPLOG, &op_id.to_string()).await
    }

    /// Unacknowledged operations after `cursor`, oldest first.
    pub async fn pending_after(
        &self,
        cursor: Option<OperationId>,
        limit: usize,
    ) -> Result<Vec<ChangeOperation>> {
        let mut pending = Vec::new();
        let mut after = cursor.map(|c| c.to_string());

        while pending.len() < limit {
            let page = self
                .docs
                .scan_after(ns::OPLOG, after.as_deref(), limit)
                .await?;
            let Some((last_key, _)) = page.last() else {
                break;
            };
            after = Some(last_key.clone());

            for (key, bytes) in page {
                if self.docs.get(ns::ACKS, &key).await?.is_some() {
                    continue;
                }
                let op: ChangeOperation = serde_json::from_slice(&bytes)
                    .map_err(|e| ReplicaError::persistence(&format!("decode oplog/{key}"), e))?;
                pending.push(op);
                if pending.len() == limit {
                    break;
                }
            }
        }
        Ok(pending)
    }

    /// Record relay acknowledgement. Idempotent.
    pub async fn mark_acknowledged(&self, op_ids: &[OperationId]) -> Result<()> {
        for op_id in op_ids {
            put_json(
                self.docs.as_ref(),
                self.retry,
                ns::ACKS,
                &op_id.to_string(),
                &true,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn is_acknowledged(&self, op_id: &OperationId) -> Result<bool> {
        Ok(self.docs.get(ns::ACKS, &op_id.to_string()).await?.is_some())
    }

    pub async fn len(&self) -> Result<usize> {
        self.docs.count(ns::OPLOG).await
    }

    pub async fn unacknowledged_count(&self) -> Result<usize> {
        let total = self.docs.count(ns::OPLOG).await?;
        let acked = self.docs.count(ns::ACKS).await?;
        Ok(total.saturating_sub(acked))
    }

    /// Notified with the id of every appended operation.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationId> {
        self.appended.subscribe()
    }
}
