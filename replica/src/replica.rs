//! The replica facade.
//!
//! Owns the local entity store, change log and conflict ledger of one device
//! and is the only path through which entities change: local writes go
//! through [`Replica::mutate`] / [`Replica::delete`], remote operations
//! through [`Replica::apply_envelopes`].
//!
//! Lock order is replica clock, then entity. The remote path never takes the
//! clock while holding an entity lock.

use crate::change_log::ChangeLog;
use crate::cipher::PayloadCipher;
use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, Result};
use crate::health::{HealthRegistry, HealthSnapshot};
use crate::ledger::{ConflictEvent, ConflictLedger};
use crate::now_ms;
use crate::storage::{get_json, ns, put_json, DocumentStore, EntityStore, RetryPolicy};
use concord_engine::{
    ChangeOperation, ConflictRecord, EntityId, EntityVersion, Error as EngineError, FieldValue,
    MergeEngine, OpKind, OperationId, ReplicaId, ReplicaSnapshot, StrategyRegistry, SyncEnvelope,
    Timestamp, VectorClock,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const CLOCK_KEY: &str = "clock";

/// What happened to the envelopes of one pulled batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Changed local state
    pub applied: usize,
    /// Already reflected locally
    pub duplicates: usize,
    /// New conflict records raised
    pub conflicts: usize,
    pub quarantined: usize,
    /// Not applied because of a local write failure
    pub failed: usize,
    /// Entities whose application stopped on a write failure
    pub blocked_entities: BTreeSet<EntityId>,
    /// Last envelope such that it and everything before it were handled
    pub contiguous_through: Option<OperationId>,
    /// Last write failure, if any
    pub failure: Option<String>,
}

impl ApplyReport {
    /// Every envelope was handled.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

enum EnvelopeOutcome {
    Applied { conflicts: usize },
    Duplicate,
    Quarantined,
}

/// A local-first replica.
pub struct Replica {
    config: ReplicaConfig,
    docs: Arc<dyn DocumentStore>,
    engine: MergeEngine,
    entities: EntityStore,
    change_log: ChangeLog,
    ledger: ConflictLedger,
    cipher: Arc<dyn PayloadCipher>,
    clock: Mutex<VectorClock>,
    health: HealthRegistry,
    retry: RetryPolicy,
}

impl Replica {
    /// Open a replica over `docs`, replaying any logged local operation the
    /// entity store missed.
    pub async fn open(
        config: ReplicaConfig,
        docs: Arc<dyn DocumentStore>,
        registry: StrategyRegistry,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy {
            attempts: config.sync.persistence_retry_limit,
            base_delay: config.sync.persistence_retry_delay(),
        };

        let clock: VectorClock = get_json(docs.as_ref(), ns::META, CLOCK_KEY)
            .await?
            .unwrap_or_default();
        let change_log = ChangeLog::open(docs.clone(), retry).await?;

        let replica = Self {
            entities: EntityStore::new(docs.clone(), retry),
            ledger: ConflictLedger::new(docs.clone(), retry),
            engine: MergeEngine::new(registry),
            clock: Mutex::new(clock),
            health: HealthRegistry::new(),
            change_log,
            cipher,
            config,
            docs,
            retry,
        };
        let recovered = replica.recover().await?;

        info!(
            replica_id = %replica.config.replica_id,
            entities = replica.entities.count().await?,
            recovered,
            "Replica opened"
        );
        Ok(replica)
    }

    /// Re-apply unacknowledged local operations. Merge is idempotent, so
    /// operations already reflected are no-ops.
    async fn recover(&self) -> Result<usize> {
        let pending = self.change_log.pending_after(None, usize::MAX).await?;
        let mut recovered = 0;
        let mut seen = VectorClock::new();
        let now = now_ms();

        for op in &pending {
            seen = seen.merge(&op.clock_at_write);
            let _guard = self.entities.lock(&op.entity_id).await;
            let local = self.entities.get(&op.entity_id).await?;
            let outcome = self.engine.apply(local.as_ref(), op, now)?;
            if outcome.changed {
                warn!(op_id = %op.op_id, entity_id = %op.entity_id, "Recovered local operation");
                self.entities.put(&outcome.merged).await?;
                recovered += 1;
            }
        }

        if !pending.is_empty() {
            self.observe_clock(&seen).await?;
        }
        Ok(recovered)
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.config.replica_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn ledger(&self) -> &ConflictLedger {
        &self.ledger
    }

    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    pub(crate) fn documents(&self) -> &dyn DocumentStore {
        self.docs.as_ref()
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Current replica clock.
    pub async fn clock(&self) -> VectorClock {
        self.clock.lock().await.clone()
    }

    // ---- Local mutation API ----

    /// Write one field of an entity, creating the entity if needed.
    pub async fn mutate(
        &self,
        entity_id: &str,
        entity_type: &str,
        field: &str,
        value: FieldValue,
    ) -> Result<OperationId> {
        self.write_local(
            entity_id,
            Some(entity_type),
            OpKind::Set {
                field: field.to_string(),
                value,
            },
        )
        .await
    }

    /// Soft-delete an entity. Its data stays for audit.
    pub async fn delete(&self, entity_id: &str) -> Result<OperationId> {
        self.write_local(entity_id, None, OpKind::Delete).await
    }

    /// The locally merged view of an entity, tombstoned or not.
    pub async fn read(&self, entity_id: &str) -> Result<Option<EntityVersion>> {
        self.entities.get(entity_id).await
    }

    /// Non-tombstoned entities, optionally of one type, ordered by id.
    pub async fn list_active(&self, entity_type: Option<&str>) -> Result<Vec<EntityVersion>> {
        Ok(self
            .entities
            .all()
            .await?
            .into_iter()
            .filter(|e| e.is_active())
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .collect())
    }

    async fn write_local(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        kind: OpKind,
    ) -> Result<OperationId> {
        let mut clock = self.clock.lock().await;
        let _guard = self.entities.lock(entity_id).await;
        let local = self.entities.get(entity_id).await?;

        let entity_type = match (&local, entity_type) {
            (Some(local), Some(requested)) if local.entity_type != requested => {
                return Err(EngineError::InvariantViolation {
                    entity_id: entity_id.to_string(),
                    reason: format!(
                        "entity has type '{}', write targets '{requested}'",
                        local.entity_type
                    ),
                }
                .into());
            }
            (Some(local), _) => local.entity_type.clone(),
            (None, Some(requested)) => requested.to_string(),
            (None, None) => return Err(ReplicaError::NotFound(entity_id.to_string())),
        };

        // The write must dominate everything this entity already holds
        let mut next = clock.clone();
        if let Some(local) = &local {
            next = next.merge(&local.version_clock());
        }
        let next = next.tick(&self.config.replica_id);
        put_json(self.docs.as_ref(), self.retry, ns::META, CLOCK_KEY, &next).await?;
        *clock = next.clone();

        let now = now_ms();
        let op_id = self.change_log.next_id()?;
        let op = match kind {
            OpKind::Set { field, value } => ChangeOperation::set(
                op_id,
                entity_id,
                entity_type,
                field,
                value,
                next,
                self.config.replica_id.clone(),
            ),
            OpKind::Delete => ChangeOperation::delete(
                op_id,
                entity_id,
                entity_type,
                next,
                self.config.replica_id.clone(),
            ),
        }
        .at(now);

        // Logged first: a crash before the entity write is repaired on open
        self.change_log.append(&op).await?;
        let outcome = self.engine.apply(local.as_ref(), &op, now)?;
        for conflict in outcome.conflicts {
            self.ledger.record(conflict).await?;
        }
        self.entities.put(&outcome.merged).await?;
        self.settle_replaced(local.as_ref(), &outcome.merged, now).await?;

        debug!(
            op_id = %op.op_id,
            entity_id,
            field = op.field_name().unwrap_or("<delete>"),
            clock = %op.clock_at_write,
            "Local write"
        );
        Ok(op.op_id)
    }

    /// Join a remote clock into the replica clock.
    async fn observe_clock(&self, seen: &VectorClock) -> Result<()> {
        let mut clock = self.clock.lock().await;
        let joined = clock.merge(seen);
        if joined != *clock {
            put_json(self.docs.as_ref(), self.retry, ns::META, CLOCK_KEY, &joined).await?;
            *clock = joined;
        }
        Ok(())
    }

    /// Flag conflicts whose field `merged` no longer holds siblings for.
    async fn settle_replaced(
        &self,
        local: Option<&EntityVersion>,
        merged: &EntityVersion,
        now: Timestamp,
    ) -> Result<()> {
        let Some(local) = local else {
            return Ok(());
        };
        for field in local.contested_fields() {
            if !merged.siblings.contains_key(field) {
                self.ledger.settle(&merged.entity_id, field, now).await?;
            }
        }
        Ok(())
    }

    // ---- Conflict API ----

    pub async fn list_unresolved(&self, entity_id: Option<&str>) -> Result<Vec<ConflictRecord>> {
        self.ledger.list_unresolved(entity_id).await
    }

    /// Apply a manual choice.
    ///
    /// The record is claimed first, so a concurrent resolution of the same
    /// conflict fails with `AlreadyResolved` before writing anything. The
    /// choice is then written as a new local operation that causally follows
    /// every candidate, so it replaces them on every replica, and the record
    /// is marked resolved. A failed write releases the claim.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolver_id: &str,
        chosen_value: FieldValue,
    ) -> Result<(ConflictRecord, OperationId)> {
        let record = self.ledger.claim(conflict_id).await?;

        let resolved: Result<(ConflictRecord, OperationId)> = async {
            let op_id = self
                .mutate(
                    &record.entity_id,
                    &record.entity_type,
                    &record.field_name,
                    chosen_value.clone(),
                )
                .await?;
            let record = self
                .ledger
                .resolve(conflict_id, resolver_id, chosen_value, now_ms())
                .await?;
            Ok((record, op_id))
        }
        .await;

        if resolved.is_err() {
            self.ledger.release(conflict_id).await;
        }
        resolved
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.ledger.subscribe()
    }

    /// Archive conflict records past the configured retention window.
    pub async fn archive_expired_conflicts(&self) -> Result<usize> {
        self.ledger
            .archive_expired(now_ms(), self.config.sync.conflict_retention_ms())
            .await
    }

    // ---- Sync ----

    /// Seal a logged operation for the relay.
    pub fn seal(&self, op: &ChangeOperation) -> Result<SyncEnvelope> {
        let plaintext = serde_json::to_vec(op)
            .map_err(|e| EngineError::InvalidEnvelope(format!("encode {}: {e}", op.op_id)))?;
        Ok(SyncEnvelope {
            entity_id: op.entity_id.clone(),
            op_id: op.op_id,
            origin_replica: op.origin_replica.clone(),
            clock: op.clock_at_write.clone(),
            encrypted_payload: self.cipher.seal(&op.op_id, &plaintext)?,
        })
    }

    /// Open an envelope and check its metadata against the sealed operation.
    pub fn open_envelope(&self, envelope: &SyncEnvelope) -> Result<ChangeOperation> {
        let plaintext = self
            .cipher
            .open(&envelope.op_id, &envelope.encrypted_payload)?;
        let op: ChangeOperation = serde_json::from_slice(&plaintext).map_err(|e| {
            EngineError::InvalidEnvelope(format!("decode {}: {e}", envelope.op_id))
        })?;

        if op.op_id != envelope.op_id
            || op.entity_id != envelope.entity_id
            || op.origin_replica != envelope.origin_replica
            || op.clock_at_write != envelope.clock
        {
            return Err(EngineError::InvalidEnvelope(format!(
                "metadata of {} does not match its payload",
                envelope.op_id
            ))
            .into());
        }
        Ok(op)
    }

    /// Apply a batch of remote envelopes in order.
    ///
    /// Each envelope is handled independently. Envelopes that cannot be
    /// opened or fail merge integrity are quarantined. A local write failure
    /// blocks that entity for the rest of the batch; the report says how far
    /// the batch was handled without gaps.
    pub async fn apply_envelopes(&self, envelopes: &[SyncEnvelope]) -> Result<ApplyReport> {
        let now = now_ms();
        let mut report = ApplyReport::default();
        let mut seen = VectorClock::new();
        let mut contiguous = true;

        for envelope in envelopes {
            if report.blocked_entities.contains(&envelope.entity_id) {
                report.failed += 1;
                contiguous = false;
                continue;
            }

            match self.apply_envelope(envelope, now).await {
                Ok(EnvelopeOutcome::Applied { conflicts }) => {
                    report.applied += 1;
                    report.conflicts += conflicts;
                    seen = seen.merge(&envelope.clock);
                }
                Ok(EnvelopeOutcome::Duplicate) => {
                    report.duplicates += 1;
                    seen = seen.merge(&envelope.clock);
                }
                Ok(EnvelopeOutcome::Quarantined) => report.quarantined += 1,
                Err(e) => {
                    warn!(
                        op_id = %envelope.op_id,
                        entity_id = %envelope.entity_id,
                        error = %e,
                        "Failed to apply envelope, entity blocked for this batch"
                    );
                    report.failed += 1;
                    report.failure = Some(e.to_string());
                    report.blocked_entities.insert(envelope.entity_id.clone());
                    contiguous = false;
                    continue;
                }
            }

            if contiguous {
                report.contiguous_through = Some(envelope.op_id);
            }
        }

        self.observe_clock(&seen).await?;
        Ok(report)
    }

    async fn apply_envelope(
        &self,
        envelope: &SyncEnvelope,
        now: Timestamp,
    ) -> Result<EnvelopeOutcome> {
        if self.ledger.is_quarantined(&envelope.op_id).await? {
            return Ok(EnvelopeOutcome::Quarantined);
        }

        let op = match self.open_envelope(envelope) {
            Ok(op) => op,
            Err(e @ (ReplicaError::Crypto(_) | ReplicaError::Engine(_))) => {
                self.ledger
                    .quarantine(envelope.clone(), e.to_string(), now)
                    .await?;
                return Ok(EnvelopeOutcome::Quarantined);
            }
            Err(e) => return Err(e),
        };

        let _guard = self.entities.lock(&op.entity_id).await;
        let local = self.entities.get(&op.entity_id).await?;
        let outcome = match self.engine.apply(local.as_ref(), &op, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.ledger
                    .quarantine(envelope.clone(), e.to_string(), now)
                    .await?;
                return Ok(EnvelopeOutcome::Quarantined);
            }
        };
        if !outcome.changed {
            return Ok(EnvelopeOutcome::Duplicate);
        }

        // Recorded before the entity so a failed entity write re-raises the
        // same (idempotent) records on redelivery
        let conflicts = outcome.conflicts.len();
        for conflict in outcome.conflicts {
            self.ledger.record(conflict).await?;
        }
        self.entities.put(&outcome.merged).await?;
        self.settle_replaced(local.as_ref(), &outcome.merged, now).await?;

        if outcome.resurrected {
            info!(entity_id = %op.entity_id, op_id = %op.op_id, "Entity resurrected by later edit");
        }
        Ok(EnvelopeOutcome::Applied { conflicts })
    }

    // ---- State transfer ----

    /// Every entity this replica holds.
    pub async fn export_state(&self) -> Result<ReplicaSnapshot> {
        let mut snapshot = ReplicaSnapshot::new(self.config.replica_id.clone(), self.clock().await);
        for entity in self.entities.all().await? {
            snapshot.add_entity(entity);
        }
        Ok(snapshot)
    }

    /// Merge a snapshot from another replica into local state.
    ///
    /// Returns how many entities changed.
    pub async fn import_state(&self, snapshot: &ReplicaSnapshot) -> Result<usize> {
        snapshot.validate()?;
        let now = now_ms();
        let mut changed = 0;

        for remote in snapshot.entities.values() {
            let _guard = self.entities.lock(&remote.entity_id).await;
            let local = self.entities.get(&remote.entity_id).await?;
            let merged = match &local {
                Some(local) => {
                    let outcome = self.engine.merge(local, remote, now)?;
                    for conflict in outcome.conflicts {
                        self.ledger.record(conflict).await?;
                    }
                    outcome.changed.then_some(outcome.merged)
                }
                None => Some(remote.clone()),
            };
            if let Some(merged) = merged {
                self.entities.put(&merged).await?;
                self.settle_replaced(local.as_ref(), &merged, now).await?;
                changed += 1;
            }
        }

        self.observe_clock(&snapshot.clock).await?;
        info!(
            from = %snapshot.replica_id,
            entities = snapshot.entities.len(),
            changed,
            "Imported snapshot"
        );
        Ok(changed)
    }

    // ---- Health ----

    pub async fn health(&self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            replica_id: self.config.replica_id.clone(),
            unresolved_conflict_count: self.ledger.unresolved_count().await?,
            pending_operations: self.change_log.unacknowledged_count().await?,
            quarantined_operations: self.docs.count(ns::QUARANTINE).await?,
            peers: self.health.peers(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesGcmCipher;
    use crate::config::SyncTuning;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use concord_engine::{EntityTypeDef, FieldDef};
    use serde_json::json;
    use std::time::Duration;

    const KEY: [u8; 32] = [42; 32];

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new().with_type(
            EntityTypeDef::new("transaction")
                .with_field(FieldDef::value("amount"))
                .with_field(FieldDef::text("memo")),
        )
    }

    async fn open_on(id: &str, docs: Arc<dyn DocumentStore>) -> Replica {
        Replica::open(
            ReplicaConfig::new(id).with_sync(SyncTuning::testing()),
            docs,
            registry(),
            Arc::new(AesGcmCipher::new(&KEY)),
        )
        .await
        .unwrap()
    }

    /// Memory store whose writes yield for a moment, widening races.
    struct SlowStore(MemoryStore);

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.0.put(namespace, key, value).await
        }

        async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(namespace, key).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
            self.0.delete(namespace, key).await
        }

        async fn scan_after(
            &self,
            namespace: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<(String, Vec<u8>)>> {
            self.0.scan_after(namespace, after, limit).await
        }
    }

    async fn replica(id: &str) -> Replica {
        open_on(id, Arc::new(MemoryStore::new())).await
    }

    /// Envelopes for every local operation of `from`.
    async fn outbox(from: &Replica) -> Vec<SyncEnvelope> {
        from.change_log
            .pending_after(None, usize::MAX)
            .await
            .unwrap()
            .iter()
            .map(|op| from.seal(op).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn mutate_and_read() {
        let a = replica("a").await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();

        let entity = a.read("txn-1").await.unwrap().unwrap();
        assert_eq!(entity.get("amount"), Some(&json!(100)));
        assert_eq!(a.clock().await.get("a"), 1);
        assert_eq!(a.change_log().len().await.unwrap(), 1);
        assert_eq!(a.list_active(Some("transaction")).await.unwrap().len(), 1);
        assert!(a.list_active(Some("invoice")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_entity_is_not_found() {
        let a = replica("a").await;
        assert!(matches!(
            a.delete("missing").await,
            Err(ReplicaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected() {
        let a = replica("a").await;
        a.mutate("txn-1", "transaction", "amount", json!(1))
            .await
            .unwrap();
        let err = a
            .mutate("txn-1", "invoice", "amount", json!(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Engine(_)));
    }

    #[tokio::test]
    async fn delete_hides_from_active_views() {
        let a = replica("a").await;
        a.mutate("txn-1", "transaction", "amount", json!(1))
            .await
            .unwrap();
        a.delete("txn-1").await.unwrap();

        assert!(a.list_active(None).await.unwrap().is_empty());
        let entity = a.read("txn-1").await.unwrap().unwrap();
        assert!(entity.tombstone);
        assert_eq!(entity.get("amount"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn envelopes_roundtrip_between_replicas() {
        let a = replica("a").await;
        let b = replica("b").await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();

        let envelopes = outbox(&a).await;
        let report = b.apply_envelopes(&envelopes).await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.is_complete());
        assert_eq!(report.contiguous_through, Some(envelopes[0].op_id));
        assert_eq!(b.read("txn-1").await.unwrap(), a.read("txn-1").await.unwrap());

        // Redelivery is a no-op
        let again = b.apply_envelopes(&envelopes).await.unwrap();
        assert_eq!(again.duplicates, 1);
        assert_eq!(again.applied, 0);
    }

    #[tokio::test]
    async fn concurrent_writes_raise_one_conflict() {
        let a = replica("a").await;
        let b = replica("b").await;
        let mut events = b.subscribe_conflicts();

        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();
        b.mutate("txn-1", "transaction", "amount", json!(150))
            .await
            .unwrap();

        let report = b.apply_envelopes(&outbox(&a).await).await.unwrap();
        assert_eq!(report.conflicts, 1);

        let unresolved = b.list_unresolved(Some("txn-1")).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].candidate_values.len(), 2);
        assert!(matches!(events.recv().await.unwrap(), ConflictEvent::Created(_)));

        let merged = b.read("txn-1").await.unwrap().unwrap();
        assert_eq!(merged.get("amount"), Some(&unresolved[0].auto_resolution));
    }

    #[tokio::test]
    async fn manual_resolution_propagates() {
        let a = replica("a").await;
        let b = replica("b").await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();
        b.mutate("txn-1", "transaction", "amount", json!(150))
            .await
            .unwrap();
        b.apply_envelopes(&outbox(&a).await).await.unwrap();
        a.apply_envelopes(&outbox(&b).await).await.unwrap();

        let conflict = b.list_unresolved(None).await.unwrap().remove(0);
        let (record, _) = b
            .resolve_conflict(&conflict.conflict_id, "user-1", json!(125))
            .await
            .unwrap();
        assert_eq!(record.resolved_value, Some(json!(125)));
        assert!(matches!(
            b.resolve_conflict(&conflict.conflict_id, "user-1", json!(1))
                .await,
            Err(ReplicaError::AlreadyResolved(_))
        ));

        let resolved = b.read("txn-1").await.unwrap().unwrap();
        assert_eq!(resolved.get("amount"), Some(&json!(125)));
        assert!(resolved.siblings.is_empty());

        // The resolving write supersedes both candidates on the other side
        let mut events = a.subscribe_conflicts();
        assert_eq!(a.list_unresolved(None).await.unwrap().len(), 1);
        a.apply_envelopes(&outbox(&b).await).await.unwrap();
        assert_eq!(a.read("txn-1").await.unwrap(), b.read("txn-1").await.unwrap());

        assert!(a.list_unresolved(None).await.unwrap().is_empty());
        assert_eq!(a.health().await.unwrap().unresolved_conflict_count, 0);
        let kept = a.ledger().get(&conflict.conflict_id).await.unwrap().unwrap();
        assert!(kept.is_superseded());
        assert!(!kept.is_resolved());
        assert!(matches!(events.recv().await.unwrap(), ConflictEvent::Superseded(_)));
    }

    #[tokio::test]
    async fn concurrent_resolutions_write_once() {
        let a = replica("a").await;
        let b = open_on("b", Arc::new(SlowStore(MemoryStore::new()))).await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();
        b.mutate("txn-1", "transaction", "amount", json!(150))
            .await
            .unwrap();
        b.apply_envelopes(&outbox(&a).await).await.unwrap();
        let conflict = b.list_unresolved(None).await.unwrap().remove(0);
        let logged = b.change_log().len().await.unwrap();

        let (first, second) = tokio::join!(
            b.resolve_conflict(&conflict.conflict_id, "user-1", json!(125)),
            b.resolve_conflict(&conflict.conflict_id, "user-2", json!(999)),
        );
        let (winner, loser) = match (first, second) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            other => panic!("expected exactly one resolution, got {other:?}"),
        };
        assert!(matches!(loser, ReplicaError::AlreadyResolved(_)));

        let (record, _) = winner;
        let entity = b.read("txn-1").await.unwrap().unwrap();
        assert_eq!(entity.get("amount"), record.resolved_value.as_ref());
        assert_eq!(b.change_log().len().await.unwrap(), logged + 1);
    }

    #[tokio::test]
    async fn failed_resolution_write_releases_claim() {
        let docs = Arc::new(MemoryStore::new());
        let a = replica("a").await;
        let b = open_on("b", docs.clone()).await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();
        b.mutate("txn-1", "transaction", "amount", json!(150))
            .await
            .unwrap();
        b.apply_envelopes(&outbox(&a).await).await.unwrap();
        let conflict = b.list_unresolved(None).await.unwrap().remove(0);

        docs.fail_key(ns::META, CLOCK_KEY);
        let failed = b
            .resolve_conflict(&conflict.conflict_id, "user-1", json!(125))
            .await;
        assert!(matches!(failed, Err(ReplicaError::Persistence { .. })));
        assert_eq!(b.list_unresolved(None).await.unwrap().len(), 1);

        docs.heal_key(ns::META, CLOCK_KEY);
        let (record, _) = b
            .resolve_conflict(&conflict.conflict_id, "user-1", json!(125))
            .await
            .unwrap();
        assert_eq!(record.resolved_value, Some(json!(125)));
    }

    #[tokio::test]
    async fn tampered_envelope_is_quarantined() {
        let a = replica("a").await;
        let b = replica("b").await;
        a.mutate("txn-1", "transaction", "amount", json!(100))
            .await
            .unwrap();
        a.mutate("txn-2", "transaction", "amount", json!(7))
            .await
            .unwrap();

        let mut envelopes = outbox(&a).await;
        let last = envelopes[0].encrypted_payload.len() - 1;
        envelopes[0].encrypted_payload[last] ^= 0xff;

        let report = b.apply_envelopes(&envelopes).await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.applied, 1);
        assert!(report.is_complete());
        assert_eq!(b.ledger().list_quarantined().await.unwrap().len(), 1);
        assert!(b.read("txn-1").await.unwrap().is_none());
        assert!(b.read("txn-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_failure_blocks_only_that_entity() {
        let a = replica("a").await;
        let docs = Arc::new(MemoryStore::new());
        let b = open_on("b", docs.clone()).await;

        a.mutate("txn-1", "transaction", "amount", json!(1))
            .await
            .unwrap();
        a.mutate("txn-2", "transaction", "amount", json!(2))
            .await
            .unwrap();
        a.mutate("txn-1", "transaction", "amount", json!(3))
            .await
            .unwrap();
        let envelopes = outbox(&a).await;

        docs.fail_key(ns::ENTITIES, "txn-1");
        let report = b.apply_envelopes(&envelopes).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.applied, 1);
        assert!(report.blocked_entities.contains("txn-1"));
        assert_eq!(report.contiguous_through, None);
        assert!(report.failure.is_some());

        // Once healed, redelivering the same batch catches up
        docs.heal_key(ns::ENTITIES, "txn-1");
        let retry = b.apply_envelopes(&envelopes).await.unwrap();
        assert!(retry.is_complete());
        assert_eq!(retry.duplicates, 1);
        assert_eq!(
            b.read("txn-1").await.unwrap().unwrap().get("amount"),
            Some(&json!(3))
        );
    }

    #[tokio::test]
    async fn reopen_recovers_logged_write() {
        let docs = Arc::new(MemoryStore::new());
        let a = open_on("a", docs.clone()).await;
        a.mutate("txn-1", "transaction", "amount", json!(1))
            .await
            .unwrap();

        // Entity write fails after the operation was logged
        docs.fail_key(ns::ENTITIES, "txn-1");
        assert!(a
            .mutate("txn-1", "transaction", "amount", json!(2))
            .await
            .is_err());
        docs.heal_key(ns::ENTITIES, "txn-1");
        drop(a);

        let reopened = open_on("a", docs).await;
        let entity = reopened.read("txn-1").await.unwrap().unwrap();
        assert_eq!(entity.get("amount"), Some(&json!(2)));
        assert_eq!(reopened.clock().await.get("a"), 2);
    }

    #[tokio::test]
    async fn export_then_import() {
        let a = replica("a").await;
        let b = replica("b").await;
        a.mutate("txn-1", "transaction", "amount", json!(5))
            .await
            .unwrap();

        let snapshot = a.export_state().await.unwrap();
        assert_eq!(b.import_state(&snapshot).await.unwrap(), 1);
        assert_eq!(b.import_state(&snapshot).await.unwrap(), 0);
        assert_eq!(
            b.export_state().await.unwrap().entities_digest().unwrap(),
            snapshot.entities_digest().unwrap()
        );
        // b's next write follows a's
        assert_eq!(b.clock().await.get("a"), 1);
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let a = replica("a").await;
        a.mutate("txn-1", "transaction", "amount", json!(5))
            .await
            .unwrap();
        let health = a.health().await.unwrap();
        assert_eq!(health.pending_operations, 1);
        assert_eq!(health.unresolved_conflict_count, 0);
        assert!(health.peers.is_empty());
    }
}
