//! In-memory envelope store for development and tests.

use super::{AppendOutcome, EnvelopePage, EnvelopeStore, StoreStats};
use crate::error::Result;
use async_trait::async_trait;
use concord_engine::{OperationId, ReplicaId, SyncEnvelope};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    /// Position `i` holds sequence `i + 1`
    log: Vec<SyncEnvelope>,
    seq_by_op: HashMap<OperationId, u64>,
    delivered: HashMap<ReplicaId, u64>,
    last_seen: HashMap<ReplicaId, Instant>,
}

impl Inner {
    fn resolve(&self, cursor: Option<&OperationId>) -> u64 {
        cursor
            .and_then(|id| self.seq_by_op.get(id))
            .copied()
            .unwrap_or(0)
    }

    fn backlog(&self, replica_id: &str, after: u64) -> u64 {
        self.log
            .iter()
            .skip(after as usize)
            .filter(|envelope| envelope.origin_replica != replica_id)
            .count() as u64
    }
}

/// Envelope log held behind a single lock. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryEnvelopeStore {
    inner: RwLock<Inner>,
}

impl MemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvelopeStore for MemoryEnvelopeStore {
    async fn append(&self, envelopes: &[SyncEnvelope]) -> Result<AppendOutcome> {
        let mut inner = self.inner.write().await;
        let mut outcome = AppendOutcome::default();

        for envelope in envelopes {
            if inner.seq_by_op.contains_key(&envelope.op_id) {
                outcome.duplicates.push(envelope.op_id);
                continue;
            }
            inner.log.push(envelope.clone());
            let seq = inner.log.len() as u64;
            inner.seq_by_op.insert(envelope.op_id, seq);
            outcome.stored.push(envelope.op_id);
        }

        Ok(outcome)
    }

    async fn fetch_after(
        &self,
        cursor: Option<&OperationId>,
        requester: &str,
        limit: usize,
    ) -> Result<EnvelopePage> {
        let inner = self.inner.read().await;
        let after = inner.resolve(cursor);
        let remaining = inner.log.get(after as usize..).unwrap_or_default();
        let scanned = &remaining[..remaining.len().min(limit)];

        let cursor = match scanned.last() {
            Some(last) => Some(last.op_id),
            None if after > 0 => cursor.copied(),
            None => None,
        };

        Ok(EnvelopePage {
            envelopes: scanned
                .iter()
                .filter(|envelope| envelope.origin_replica != requester)
                .cloned()
                .collect(),
            cursor,
            has_more: remaining.len() > scanned.len(),
        })
    }

    async fn register_replica(&self, replica_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.delivered.entry(replica_id.to_string()).or_insert(0);
        inner.last_seen.insert(replica_id.to_string(), Instant::now());
        Ok(())
    }

    async fn record_delivery(&self, replica_id: &str, cursor: Option<&OperationId>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let seq = inner.resolve(cursor);
        inner.delivered.insert(replica_id.to_string(), seq);
        inner.last_seen.insert(replica_id.to_string(), Instant::now());
        Ok(())
    }

    async fn queue_depth_for(&self, replica_id: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        let after = inner.delivered.get(replica_id).copied().unwrap_or(0);
        Ok(inner.backlog(replica_id, after))
    }

    async fn queue_depth(&self, active_within: Duration) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .delivered
            .iter()
            .filter(|(replica, _)| {
                inner
                    .last_seen
                    .get(*replica)
                    .is_some_and(|seen| seen.elapsed() <= active_within)
            })
            .map(|(replica, after)| inner.backlog(replica, *after))
            .max()
            .unwrap_or(0))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.read().await;
        Ok(StoreStats {
            envelopes: inner.log.len() as u64,
            replicas: inner.delivered.len() as u64,
        })
    }
}
