//! Conflict ledger and notifier.
//!
//! Durable store of every [`ConflictRecord`] the merge engine raised. Records
//! are never deleted: a manual resolution mutates a record exactly once, and
//! records past the retention window are flagged archived but stay in
//! [`history`](ConflictLedger::list_history). A record whose candidates were
//! all replaced by a later write (a resolution synced from another replica)
//! is flagged superseded and no longer counts as unresolved.
//!
//! Listeners receive [`ConflictEvent`]s over a broadcast channel. Sending
//! never waits on a listener; a lagging listener loses the oldest events and
//! can re-read the ledger.

use crate::error::{ReplicaError, Result};
use crate::storage::{get_json, ns, put_json, scan_json, DocumentStore, RetryPolicy};
use concord_engine::{
    ConflictId, ConflictRecord, FieldValue, OperationId, SyncEnvelope, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Notification emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "conflict", rename_all = "snake_case")]
pub enum ConflictEvent {
    Created(ConflictRecord),
    Resolved(ConflictRecord),
    Superseded(ConflictRecord),
}

impl ConflictEvent {
    pub fn record(&self) -> &ConflictRecord {
        match self {
            ConflictEvent::Created(record)
            | ConflictEvent::Resolved(record)
            | ConflictEvent::Superseded(record) => record,
        }
    }
}

/// An envelope that could not be applied, held for inspection.
///
/// The sealed payload is kept as received so it can be reopened once the
/// cause is understood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedOperation {
    pub envelope: SyncEnvelope,
    pub reason: String,
    pub quarantined_at: Timestamp,
}

pub struct ConflictLedger {
    docs: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    /// Serializes writers; holds the ids of resolutions in progress
    write_lock: Mutex<HashSet<ConflictId>>,
    events: broadcast::Sender<ConflictEvent>,
}

impl ConflictLedger {
    pub fn new(docs: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            docs,
            retry,
            write_lock: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Store a conflict raised by the merge engine.
    ///
    /// Conflict ids are content digests, so the same race seen twice (a
    /// redelivered operation, or both sides of a gossip exchange) maps to
    /// the same record. An existing record is left untouched and no event
    /// is sent.
    pub async fn record(&self, conflict: ConflictRecord) -> Result<ConflictId> {
        let _guard = self.write_lock.lock().await;
        let id = conflict.conflict_id.clone();

        if self.docs.get(ns::CONFLICTS, &id).await?.is_some() {
            return Ok(id);
        }
        put_json(self.docs.as_ref(), self.retry, ns::CONFLICTS, &id, &conflict).await?;

        info!(
            conflict_id = %id,
            entity_id = %conflict.entity_id,
            field = %conflict.field_name,
            candidates = conflict.candidate_values.len(),
            "Conflict recorded"
        );
        self.notify(ConflictEvent::Created(conflict));
        Ok(id)
    }

    /// Reserve an unresolved conflict for one resolver.
    ///
    /// Fails with `AlreadyResolved` when the record is resolved or another
    /// resolution is in progress. The claim ends with [`resolve`] or
    /// [`release`].
    ///
    /// [`resolve`]: ConflictLedger::resolve
    /// [`release`]: ConflictLedger::release
    pub async fn claim(&self, conflict_id: &str) -> Result<ConflictRecord> {
        let mut claimed = self.write_lock.lock().await;
        let record: ConflictRecord = get_json(self.docs.as_ref(), ns::CONFLICTS, conflict_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(conflict_id.to_string()))?;

        if record.is_resolved() || !claimed.insert(record.conflict_id.clone()) {
            return Err(ReplicaError::AlreadyResolved(record.conflict_id));
        }
        Ok(record)
    }

    /// Drop a claim without resolving.
    pub async fn release(&self, conflict_id: &str) {
        self.write_lock.lock().await.remove(conflict_id);
    }

    /// Record a manual choice for an unresolved conflict, ending any claim
    /// on it.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        resolver_id: &str,
        chosen_value: FieldValue,
        now: Timestamp,
    ) -> Result<ConflictRecord> {
        let mut claimed = self.write_lock.lock().await;
        let mut record: ConflictRecord = get_json(self.docs.as_ref(), ns::CONFLICTS, conflict_id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(conflict_id.to_string()))?;

        record.resolve(resolver_id, chosen_value, now)?;
        put_json(
            self.docs.as_ref(),
            self.retry,
            ns::CONFLICTS,
            conflict_id,
            &record,
        )
        .await?;

        claimed.remove(conflict_id);

        info!(conflict_id, resolver_id, "Conflict resolved");
        self.notify(ConflictEvent::Resolved(record.clone()));
        Ok(record)
    }

    /// Flag open records on `entity_id.field` as superseded once a write has
    /// replaced all of their candidates. Records being resolved here are
    /// left to their resolver.
    ///
    /// Returns how many records were flagged.
    pub async fn settle(&self, entity_id: &str, field: &str, now: Timestamp) -> Result<usize> {
        let claimed = self.write_lock.lock().await;
        let mut settled = 0;

        for mut record in self.all().await? {
            if record.entity_id != entity_id
                || record.field_name != field
                || !record.is_open()
                || claimed.contains(&record.conflict_id)
            {
                continue;
            }
            record.superseded_at = Some(now);
            put_json(
                self.docs.as_ref(),
                self.retry,
                ns::CONFLICTS,
                &record.conflict_id,
                &record,
            )
            .await?;
            info!(conflict_id = %record.conflict_id, entity_id, field, "Conflict superseded");
            self.notify(ConflictEvent::Superseded(record));
            settled += 1;
        }
        Ok(settled)
    }

    pub async fn get(&self, conflict_id: &str) -> Result<Option<ConflictRecord>> {
        get_json(self.docs.as_ref(), ns::CONFLICTS, conflict_id).await
    }

    /// Open conflicts, optionally for one entity, oldest first.
    pub async fn list_unresolved(&self, entity_id: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let mut records: Vec<ConflictRecord> = self
            .all()
            .await?
            .into_iter()
            .filter(ConflictRecord::is_open)
            .filter(|r| entity_id.map_or(true, |id| r.entity_id == id))
            .collect();
        sort_by_age(&mut records);
        Ok(records)
    }

    /// Every record created in `[since, until]`, resolved and archived
    /// ones included.
    pub async fn list_history(
        &self,
        since: Timestamp,
        until: Timestamp,
    ) -> Result<Vec<ConflictRecord>> {
        let mut records: Vec<ConflictRecord> = self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.created_at >= since && r.created_at <= until)
            .collect();
        sort_by_age(&mut records);
        Ok(records)
    }

    pub async fn unresolved_count(&self) -> Result<usize> {
        Ok(self.all().await?.iter().filter(|r| r.is_open()).count())
    }

    /// Flag records created before `now - retention_ms` as archived.
    ///
    /// Returns how many records were newly archived.
    pub async fn archive_expired(&self, now: Timestamp, retention_ms: u64) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cutoff = now.saturating_sub(retention_ms);
        let mut archived = 0;

        for mut record in self.all().await? {
            if record.is_archived() || record.created_at >= cutoff {
                continue;
            }
            record.archived_at = Some(now);
            put_json(
                self.docs.as_ref(),
                self.retry,
                ns::CONFLICTS,
                &record.conflict_id,
                &record,
            )
            .await?;
            archived += 1;
        }

        if archived > 0 {
            info!(archived, cutoff, "Archived expired conflict records");
        }
        Ok(archived)
    }

    /// Hold an envelope that failed to open or failed merge integrity
    /// checks. It is excluded from automatic application from then on.
    pub async fn quarantine(
        &self,
        envelope: SyncEnvelope,
        reason: impl Into<String>,
        now: Timestamp,
    ) -> Result<()> {
        let entry = QuarantinedOperation {
            envelope,
            reason: reason.into(),
            quarantined_at: now,
        };
        warn!(
            op_id = %entry.envelope.op_id,
            entity_id = %entry.envelope.entity_id,
            origin = %entry.envelope.origin_replica,
            reason = %entry.reason,
            "Envelope quarantined"
        );
        put_json(
            self.docs.as_ref(),
            self.retry,
            ns::QUARANTINE,
            &entry.envelope.op_id.to_string(),
            &entry,
        )
        .await
    }

    pub async fn is_quarantined(&self, op_id: &OperationId) -> Result<bool> {
        Ok(self
            .docs
            .get(ns::QUARANTINE, &op_id.to_string())
            .await?
            .is_some())
    }

    pub async fn list_quarantined(&self) -> Result<Vec<QuarantinedOperation>> {
        scan_json(self.docs.as_ref(), ns::QUARANTINE).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictEvent> {
        self.events.subscribe()
    }

    async fn all(&self) -> Result<Vec<ConflictRecord>> {
        scan_json(self.docs.as_ref(), ns::CONFLICTS).await
    }

    fn notify(&self, event: ConflictEvent) {
        // Err only means nobody is listening
        let _ = self.events.send(event);
    }
}

fn sort_by_age(records: &mut [ConflictRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.conflict_id.cmp(&b.conflict_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use concord_engine::{Candidate, VectorClock};
    use serde_json::json;
    use ulid::Ulid;

    fn ledger() -> ConflictLedger {
        ConflictLedger::new(Arc::new(MemoryStore::new()), RetryPolicy::default())
    }

    fn clock(replica: &str) -> VectorClock {
        VectorClock::new().tick(replica)
    }

    fn conflict(entity: &str, a: i64, b: i64, created_at: Timestamp) -> ConflictRecord {
        ConflictRecord::new(
            entity,
            "transaction",
            "amount",
            vec![
                Candidate::new("a", json!(a), clock("a")),
                Candidate::new("b", json!(b), clock("b")),
            ],
            json!(b),
            created_at,
        )
    }

    #[tokio::test]
    async fn record_and_list() {
        let ledger = ledger();
        let id = ledger.record(conflict("txn-1", 100, 150, 10)).await.unwrap();
        ledger.record(conflict("txn-2", 1, 2, 20)).await.unwrap();

        assert_eq!(ledger.list_unresolved(None).await.unwrap().len(), 2);
        let for_one = ledger.list_unresolved(Some("txn-1")).await.unwrap();
        assert_eq!(for_one.len(), 1);
        assert_eq!(for_one[0].conflict_id, id);
        assert_eq!(ledger.unresolved_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn record_is_idempotent() {
        let ledger = ledger();
        let mut events = ledger.subscribe();

        let first = ledger.record(conflict("txn-1", 100, 150, 10)).await.unwrap();
        let second = ledger.record(conflict("txn-1", 100, 150, 99)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.unresolved_count().await.unwrap(), 1);
        assert!(matches!(events.try_recv(), Ok(ConflictEvent::Created(_))));
        assert!(events.try_recv().is_err());
        // The original creation time is kept
        assert_eq!(ledger.get(&first).await.unwrap().unwrap().created_at, 10);
    }

    #[tokio::test]
    async fn resolve_once() {
        let ledger = ledger();
        let mut events = ledger.subscribe();
        let id = ledger.record(conflict("txn-1", 100, 150, 10)).await.unwrap();

        let resolved = ledger.resolve(&id, "user-1", json!(100), 50).await.unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("user-1"));
        assert_eq!(resolved.effective_value(), &json!(100));
        assert_eq!(ledger.unresolved_count().await.unwrap(), 0);

        let again = ledger.resolve(&id, "user-2", json!(150), 60).await;
        assert!(matches!(again, Err(ReplicaError::AlreadyResolved(_))));

        let _created = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            ConflictEvent::Resolved(record) => assert_eq!(record.conflict_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_excludes_second_resolver() {
        let ledger = ledger();
        let id = ledger.record(conflict("txn-1", 100, 150, 10)).await.unwrap();

        let record = ledger.claim(&id).await.unwrap();
        assert_eq!(record.conflict_id, id);
        assert!(matches!(
            ledger.claim(&id).await,
            Err(ReplicaError::AlreadyResolved(_))
        ));

        ledger.release(&id).await;
        ledger.claim(&id).await.unwrap();
        ledger.resolve(&id, "user-1", json!(100), 50).await.unwrap();
        assert!(matches!(
            ledger.claim(&id).await,
            Err(ReplicaError::AlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn settle_supersedes_open_records() {
        let ledger = ledger();
        let mut events = ledger.subscribe();
        let open = ledger.record(conflict("txn-1", 100, 150, 10)).await.unwrap();
        let claimed = ledger.record(conflict("txn-1", 1, 2, 11)).await.unwrap();
        let other = ledger.record(conflict("txn-2", 100, 150, 12)).await.unwrap();
        ledger.claim(&claimed).await.unwrap();

        assert_eq!(ledger.settle("txn-1", "amount", 20).await.unwrap(), 1);
        assert_eq!(ledger.settle("txn-1", "amount", 30).await.unwrap(), 0);

        let record = ledger.get(&open).await.unwrap().unwrap();
        assert_eq!(record.superseded_at, Some(20));
        assert!(!record.is_resolved());
        assert!(ledger.get(&claimed).await.unwrap().unwrap().is_open());

        let remaining: Vec<_> = ledger
            .list_unresolved(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.conflict_id)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&claimed) && remaining.contains(&other));
        assert_eq!(ledger.unresolved_count().await.unwrap(), 2);
        assert_eq!(ledger.list_history(0, u64::MAX).await.unwrap().len(), 3);

        let superseded: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ConflictEvent::Superseded(_)))
            .collect();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].record().conflict_id, open);
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let ledger = ledger();
        let result = ledger.resolve("missing", "user-1", json!(1), 1).await;
        assert!(matches!(result, Err(ReplicaError::NotFound(_))));
    }

    #[tokio::test]
    async fn history_includes_resolved() {
        let ledger = ledger();
        let early = ledger.record(conflict("txn-1", 1, 2, 100)).await.unwrap();
        ledger.record(conflict("txn-2", 3, 4, 200)).await.unwrap();
        ledger.record(conflict("txn-3", 5, 6, 300)).await.unwrap();
        ledger.resolve(&early, "user-1", json!(1), 400).await.unwrap();

        let window = ledger.list_history(100, 200).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].conflict_id, early);
        assert!(window[0].is_resolved());
    }

    #[tokio::test]
    async fn archive_keeps_records() {
        let ledger = ledger();
        let old = ledger.record(conflict("txn-1", 1, 2, 1_000)).await.unwrap();
        let fresh = ledger.record(conflict("txn-2", 1, 2, 9_000)).await.unwrap();

        assert_eq!(ledger.archive_expired(10_000, 5_000).await.unwrap(), 1);
        assert_eq!(ledger.archive_expired(10_000, 5_000).await.unwrap(), 0);

        assert!(ledger.get(&old).await.unwrap().unwrap().is_archived());
        assert!(!ledger.get(&fresh).await.unwrap().unwrap().is_archived());
        assert_eq!(ledger.list_history(0, u64::MAX).await.unwrap().len(), 2);
        // Archived but unresolved records still need attention
        assert_eq!(ledger.unresolved_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn quarantine_roundtrip() {
        let ledger = ledger();
        let envelope = SyncEnvelope {
            entity_id: "txn-1".into(),
            op_id: Ulid::new(),
            origin_replica: "a".into(),
            clock: clock("a"),
            encrypted_payload: vec![1, 2, 3],
        };
        ledger
            .quarantine(envelope.clone(), "equal clocks, divergent values", 7)
            .await
            .unwrap();

        assert!(ledger.is_quarantined(&envelope.op_id).await.unwrap());
        assert!(!ledger.is_quarantined(&Ulid::new()).await.unwrap());
        let held = ledger.list_quarantined().await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].envelope, envelope);
    }

    #[test]
    fn event_serialization() {
        let event = ConflictEvent::Created(conflict("txn-1", 1, 2, 5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "created");
        assert_eq!(json["conflict"]["entityId"], "txn-1");
    }
}
