//! Field-level merge of entity versions.
//!
//! # Algorithm
//!
//! For every field present on either side:
//!
//! 1. Union the candidate writes of both sides
//! 2. Drop candidates strictly dominated by another candidate
//! 3. Fail on two candidates with equal clocks but different bytes
//! 4. Materialize the survivors through the strategy registry
//! 5. Emit a [`ConflictRecord`] when the two sides' field clocks raced
//!    and more than one value survives
//!
//! Tombstone clocks are joined and the tombstone flag recomputed.
//!
//! Because the result of each step only depends on the set of writes seen,
//! merge is commutative, associative and idempotent: replicas that saw the
//! same operations converge to byte-identical versions.

use crate::{
    clock::CausalOrder,
    entity::{canonical_bytes, sort_candidates},
    error::Result,
    strategy::FieldKind,
    Candidate, ChangeOperation, ConflictId, EntityId, EntityType, EntityVersion, Error, FieldName,
    FieldValue, StrategyRegistry, Timestamp, UserId, VectorClock,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A field where two replicas wrote concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Digest of entity, field and candidates. Identical on every replica
    pub conflict_id: ConflictId,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub field_name: FieldName,
    /// Surviving concurrent writes in canonical order
    pub candidate_values: Vec<Candidate>,
    /// Deterministic default applied immediately
    pub auto_resolution: FieldValue,
    pub resolved_by: Option<UserId>,
    pub resolved_value: Option<FieldValue>,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
    /// Set once the record leaves the retention window
    #[serde(default)]
    pub archived_at: Option<Timestamp>,
    /// Set when a later write replaced every candidate, typically a
    /// resolution made on another replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<Timestamp>,
}

impl ConflictRecord {
    /// Create an unresolved record.
    pub fn new(
        entity_id: impl Into<EntityId>,
        entity_type: impl Into<EntityType>,
        field_name: impl Into<FieldName>,
        mut candidate_values: Vec<Candidate>,
        auto_resolution: FieldValue,
        created_at: Timestamp,
    ) -> Self {
        sort_candidates(&mut candidate_values);
        let entity_id = entity_id.into();
        let field_name = field_name.into();
        let conflict_id = conflict_id(&entity_id, &field_name, &candidate_values);
        Self {
            conflict_id,
            entity_id,
            entity_type: entity_type.into(),
            field_name,
            candidate_values,
            auto_resolution,
            resolved_by: None,
            resolved_value: None,
            created_at,
            resolved_at: None,
            archived_at: None,
            superseded_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    /// Still waiting for a decision: neither resolved here nor replaced by
    /// a later write.
    pub fn is_open(&self) -> bool {
        !self.is_resolved() && !self.is_superseded()
    }

    /// Value currently in effect: the manual choice if any, else the
    /// automatic one.
    pub fn effective_value(&self) -> &FieldValue {
        self.resolved_value.as_ref().unwrap_or(&self.auto_resolution)
    }

    /// Record a manual resolution. A record is resolved at most once.
    pub fn resolve(
        &mut self,
        resolver_id: impl Into<UserId>,
        chosen_value: FieldValue,
        now: Timestamp,
    ) -> Result<()> {
        if self.is_resolved() {
            return Err(Error::AlreadyResolved(self.conflict_id.clone()));
        }
        self.resolved_by = Some(resolver_id.into());
        self.resolved_value = Some(chosen_value);
        self.resolved_at = Some(now);
        Ok(())
    }
}

fn conflict_id(entity_id: &str, field: &str, candidates: &[Candidate]) -> ConflictId {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update([0]);
    hasher.update(field.as_bytes());
    for candidate in candidates {
        hasher.update([0]);
        hasher.update(candidate.origin_replica.as_bytes());
        hasher.update([0]);
        hasher.update(candidate.clock.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(canonical_bytes(&candidate.value));
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Result of merging two versions.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: EntityVersion,
    /// Conflicts raised by this merge, one per contested field
    pub conflicts: Vec<ConflictRecord>,
    /// Whether `merged` differs from the local input
    pub changed: bool,
    /// Whether a tombstoned local entity came back to life
    pub resurrected: bool,
}

/// Merges entity versions using the registered strategies.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    registry: StrategyRegistry,
}

impl MergeEngine {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Merge a remote version into a local one.
    pub fn merge(
        &self,
        local: &EntityVersion,
        remote: &EntityVersion,
        now: Timestamp,
    ) -> Result<MergeOutcome> {
        if local.entity_id != remote.entity_id {
            return Err(Error::EntityMismatch {
                local: local.entity_id.clone(),
                remote: remote.entity_id.clone(),
            });
        }
        if local.entity_type != remote.entity_type {
            return Err(Error::InvariantViolation {
                entity_id: local.entity_id.clone(),
                reason: format!(
                    "entity type changed from '{}' to '{}'",
                    local.entity_type, remote.entity_type
                ),
            });
        }
        remote.validate()?;

        let mut merged = EntityVersion::new(local.entity_id.clone(), local.entity_type.clone());
        let mut conflicts = Vec::new();

        let field_names: BTreeSet<&FieldName> =
            local.fields.keys().chain(remote.fields.keys()).collect();

        for field in field_names {
            let local_clock = local.field_clocks.get(field).cloned().unwrap_or_default();
            let remote_clock = remote.field_clocks.get(field).cloned().unwrap_or_default();
            let order = local_clock.compare(&remote_clock);

            let mut pool = local.candidates(field);
            pool.extend(remote.candidates(field));
            let mut survivors = self.surviving(&local.entity_id, field, pool)?;

            let Some((value, origin)) =
                self.registry
                    .materialize(&merged.entity_type, field, &mut survivors)
            else {
                continue;
            };

            let contested = survivors.len() > 1;
            if contested
                && order == CausalOrder::Concurrent
                && self.registry.field_kind(&merged.entity_type, field) == FieldKind::Value
            {
                conflicts.push(ConflictRecord::new(
                    merged.entity_id.clone(),
                    merged.entity_type.clone(),
                    field.clone(),
                    survivors.clone(),
                    value.clone(),
                    now,
                ));
            }

            let field_clock = survivors
                .iter()
                .fold(VectorClock::new(), |acc, c| acc.merge(&c.clock));
            merged.fields.insert(field.clone(), value);
            merged.field_clocks.insert(field.clone(), field_clock);
            merged.field_origins.insert(field.clone(), origin);
            if contested {
                merged.siblings.insert(field.clone(), survivors);
            }
        }

        merged.tombstone_clock = match (&local.tombstone_clock, &remote.tombstone_clock) {
            (Some(l), Some(r)) => Some(l.merge(r)),
            (Some(t), None) | (None, Some(t)) => Some(t.clone()),
            (None, None) => None,
        };
        merged.refresh_tombstone();

        let changed = merged != *local;
        let resurrected = local.tombstone && !merged.tombstone;

        Ok(MergeOutcome {
            merged,
            conflicts,
            changed,
            resurrected,
        })
    }

    /// Apply one operation on top of the local version, if any.
    pub fn apply(
        &self,
        local: Option<&EntityVersion>,
        op: &ChangeOperation,
        now: Timestamp,
    ) -> Result<MergeOutcome> {
        let remote = op.to_version();
        match local {
            Some(local) => self.merge(local, &remote, now),
            None => {
                let empty = EntityVersion::new(op.entity_id.clone(), op.entity_type.clone());
                self.merge(&empty, &remote, now)
            }
        }
    }

    /// Fold any number of versions of one entity into a single version.
    ///
    /// Conflicts raised along the way are deduplicated by id.
    pub fn merge_all(&self, versions: &[EntityVersion], now: Timestamp) -> Result<MergeOutcome> {
        let (first, rest) = versions.split_first().ok_or_else(|| Error::InvariantViolation {
            entity_id: String::new(),
            reason: "no versions to merge".into(),
        })?;

        let mut outcome = MergeOutcome {
            merged: first.clone(),
            conflicts: Vec::new(),
            changed: false,
            resurrected: false,
        };
        for version in rest {
            let step = self.merge(&outcome.merged, version, now)?;
            for conflict in step.conflicts {
                if !outcome
                    .conflicts
                    .iter()
                    .any(|c| c.conflict_id == conflict.conflict_id)
                {
                    outcome.conflicts.push(conflict);
                }
            }
            outcome.changed |= step.changed;
            outcome.resurrected |= step.resurrected;
            outcome.merged = step.merged;
        }
        Ok(outcome)
    }

    /// Keep the maximal candidates, rejecting equal clocks with different
    /// values.
    fn surviving(
        &self,
        entity_id: &EntityId,
        field: &str,
        mut pool: Vec<Candidate>,
    ) -> Result<Vec<Candidate>> {
        sort_candidates(&mut pool);

        let mut unique: Vec<Candidate> = Vec::with_capacity(pool.len());
        for candidate in pool {
            match unique
                .iter()
                .find(|kept| kept.clock.compare(&candidate.clock) == CausalOrder::Equal)
            {
                Some(kept) if canonical_bytes(&kept.value) != canonical_bytes(&candidate.value) => {
                    return Err(Error::MergeIntegrity {
                        entity_id: entity_id.clone(),
                        field: field.to_string(),
                        clock: candidate.clock,
                    });
                }
                Some(_) => {}
                None => unique.push(candidate),
            }
        }

        let survivors = unique
            .iter()
            .filter(|c| {
                !unique
                    .iter()
                    .any(|other| other.clock.compare(&c.clock) == CausalOrder::After)
            })
            .cloned()
            .collect();
        Ok(survivors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityTypeDef, FieldDef, ResolutionRule};
    use serde_json::json;
    use ulid::Ulid;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(r, c)| (*r, *c)).collect()
    }

    fn set(field: &str, value: FieldValue, origin: &str, c: VectorClock) -> ChangeOperation {
        ChangeOperation::set(Ulid::nil(), "txn-1", "transaction", field, value, c, origin)
    }

    fn delete(origin: &str, c: VectorClock) -> ChangeOperation {
        ChangeOperation::delete(Ulid::nil(), "txn-1", "transaction", c, origin)
    }

    fn engine() -> MergeEngine {
        MergeEngine::default()
    }

    #[test]
    fn remote_wins_when_local_is_older() {
        let engine = engine();
        let local = set("amount", json!(1), "a", clock(&[("a", 1)])).to_version();
        let remote = set("amount", json!(2), "b", clock(&[("a", 1), ("b", 1)])).to_version();

        let outcome = engine.merge(&local, &remote, 0).unwrap();
        assert_eq!(outcome.merged.get("amount"), Some(&json!(2)));
        assert_eq!(outcome.merged.field_origins["amount"], "b");
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.changed);
        assert!(outcome.merged.siblings.is_empty());
    }

    #[test]
    fn local_wins_when_remote_is_older() {
        let engine = engine();
        let local = set("amount", json!(2), "b", clock(&[("a", 1), ("b", 1)])).to_version();
        let remote = set("amount", json!(1), "a", clock(&[("a", 1)])).to_version();

        let outcome = engine.merge(&local, &remote, 0).unwrap();
        assert_eq!(outcome.merged.get("amount"), Some(&json!(2)));
        assert!(outcome.conflicts.is_empty());
        assert!(!outcome.changed);
    }

    #[test]
    fn concurrent_writes_raise_conflict() {
        let engine = engine();
        let a = set("amount", json!(100), "a", clock(&[("a", 1)])).to_version();
        let b = set("amount", json!(150), "b", clock(&[("b", 1)])).to_version();

        let ab = engine.merge(&a, &b, 10).unwrap();
        let ba = engine.merge(&b, &a, 10).unwrap();

        assert_eq!(ab.conflicts.len(), 1);
        let conflict = &ab.conflicts[0];
        assert_eq!(conflict.field_name, "amount");
        assert_eq!(
            conflict.candidate_values,
            vec![
                Candidate::new("a", json!(100), clock(&[("a", 1)])),
                Candidate::new("b", json!(150), clock(&[("b", 1)])),
            ]
        );
        assert_eq!(conflict.created_at, 10);
        assert!(!conflict.is_resolved());

        // Both replicas land on the same state and the same conflict id
        assert_eq!(ab.merged, ba.merged);
        assert_eq!(ab.conflicts, ba.conflicts);
        assert_eq!(
            ab.merged.get("amount"),
            Some(&conflict.auto_resolution)
        );
        assert_eq!(ab.merged.field_clocks["amount"], clock(&[("a", 1), ("b", 1)]));
    }

    #[test]
    fn equal_clocks_different_values_fail() {
        let engine = engine();
        let a = set("amount", json!(1), "a", clock(&[("a", 1)])).to_version();
        let b = set("amount", json!(2), "a", clock(&[("a", 1)])).to_version();

        let err = engine.merge(&a, &b, 0).unwrap_err();
        assert!(matches!(err, Error::MergeIntegrity { ref field, .. } if field == "amount"));
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn equal_clocks_same_value_is_noop() {
        let engine = engine();
        let a = set("amount", json!(1), "a", clock(&[("a", 1)])).to_version();

        let outcome = engine.merge(&a, &a.clone(), 0).unwrap();
        assert_eq!(outcome.merged, a);
        assert!(!outcome.changed);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn different_fields_both_survive() {
        let engine = engine();
        let a = set("amount", json!(100), "a", clock(&[("a", 1)])).to_version();
        let b = set("memo", json!("lunch"), "b", clock(&[("b", 1)])).to_version();

        let outcome = engine.merge(&a, &b, 0).unwrap();
        assert_eq!(outcome.merged.get("amount"), Some(&json!(100)));
        assert_eq!(outcome.merged.get("memo"), Some(&json!("lunch")));
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn later_write_supersedes_siblings() {
        let engine = engine();
        let a = set("amount", json!(100), "a", clock(&[("a", 1)])).to_version();
        let b = set("amount", json!(150), "b", clock(&[("b", 1)])).to_version();
        let contested = engine.merge(&a, &b, 0).unwrap().merged;
        assert_eq!(contested.contested_fields().count(), 1);

        let fix = set("amount", json!(125), "a", clock(&[("a", 2), ("b", 1)])).to_version();
        let outcome = engine.merge(&contested, &fix, 0).unwrap();

        assert_eq!(outcome.merged.get("amount"), Some(&json!(125)));
        assert!(outcome.merged.siblings.is_empty());
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn delete_concurrent_with_edit_wins() {
        let engine = engine();
        let edit = set("memo", json!("x"), "a", clock(&[("a", 1)]));
        let del = delete("b", clock(&[("b", 1)]));

        let left = engine.apply(None, &edit, 0).unwrap().merged;
        let left = engine.apply(Some(&left), &del, 0).unwrap().merged;
        let right = engine.apply(None, &del, 0).unwrap().merged;
        let right = engine.apply(Some(&right), &edit, 0).unwrap().merged;

        assert_eq!(left, right);
        assert!(left.tombstone);
        assert_eq!(left.get("memo"), Some(&json!("x")));
    }

    #[test]
    fn delete_after_edit_wins() {
        let engine = engine();
        let edit = set("memo", json!("x"), "a", clock(&[("a", 1)]));
        let del = delete("b", clock(&[("a", 1), ("b", 1)]));

        let v = engine.apply(None, &edit, 0).unwrap().merged;
        let outcome = engine.apply(Some(&v), &del, 0).unwrap();
        assert!(outcome.merged.tombstone);
        assert!(!outcome.resurrected);
    }

    #[test]
    fn edit_after_delete_resurrects() {
        let engine = engine();
        let del = delete("b", clock(&[("b", 1)]));
        let edit = set("memo", json!("back"), "a", clock(&[("a", 1), ("b", 1)]));

        let v = engine.apply(None, &del, 0).unwrap().merged;
        let outcome = engine.apply(Some(&v), &edit, 0).unwrap();

        assert!(!outcome.merged.tombstone);
        assert!(outcome.resurrected);
        assert_eq!(outcome.merged.tombstone_clock, Some(clock(&[("b", 1)])));
    }

    #[test]
    fn text_fields_merge_without_conflict() {
        let registry = StrategyRegistry::new()
            .with_type(EntityTypeDef::new("transaction").with_field(FieldDef::text("memo")));
        let engine = MergeEngine::new(registry);

        let a = set("memo", json!("lunch\nclient"), "a", clock(&[("a", 1)])).to_version();
        let b = set("memo", json!("lunch\nreceipt"), "b", clock(&[("b", 1)])).to_version();

        let ab = engine.merge(&a, &b, 0).unwrap();
        let ba = engine.merge(&b, &a, 0).unwrap();

        assert!(ab.conflicts.is_empty());
        assert_eq!(ab.merged, ba.merged);
        assert_eq!(ab.merged.get("memo"), Some(&json!("lunch\nclient\nreceipt")));
    }

    #[test]
    fn registered_rule_drives_auto_resolution() {
        let registry = StrategyRegistry::new().with_type(
            EntityTypeDef::new("transaction").with_rule(ResolutionRule::NumericMax),
        );
        let engine = MergeEngine::new(registry);

        let a = set("amount", json!(100), "a", clock(&[("a", 1)])).to_version();
        let b = set("amount", json!(150), "b", clock(&[("b", 1)])).to_version();

        let outcome = engine.merge(&a, &b, 0).unwrap();
        assert_eq!(outcome.conflicts[0].auto_resolution, json!(150));
        assert_eq!(outcome.merged.get("amount"), Some(&json!(150)));
    }

    #[test]
    fn mismatched_entities_rejected() {
        let engine = engine();
        let a = EntityVersion::new("txn-1", "transaction");
        let b = EntityVersion::new("txn-2", "transaction");
        assert!(matches!(
            engine.merge(&a, &b, 0),
            Err(Error::EntityMismatch { .. })
        ));
    }

    #[test]
    fn merge_all_folds_versions() {
        let engine = engine();
        let versions = vec![
            set("amount", json!(1), "a", clock(&[("a", 1)])).to_version(),
            set("amount", json!(2), "b", clock(&[("b", 1)])).to_version(),
            set("amount", json!(3), "c", clock(&[("c", 1)])).to_version(),
        ];

        let outcome = engine.merge_all(&versions, 0).unwrap();
        assert_eq!(outcome.merged.siblings["amount"].len(), 3);
        assert!(!outcome.conflicts.is_empty());
        assert!(engine.merge_all(&[], 0).is_err());
    }

    #[test]
    fn resolve_conflict_once() {
        let mut record = ConflictRecord::new(
            "txn-1",
            "transaction",
            "amount",
            vec![
                Candidate::new("b", json!(150), clock(&[("b", 1)])),
                Candidate::new("a", json!(100), clock(&[("a", 1)])),
            ],
            json!(150),
            0,
        );
        assert_eq!(record.candidate_values[0].origin_replica, "a");
        assert_eq!(record.effective_value(), &json!(150));
        assert!(record.is_open());

        record.resolve("user-1", json!(100), 5).unwrap();
        assert!(!record.is_open());
        assert_eq!(record.resolved_by.as_deref(), Some("user-1"));
        assert_eq!(record.resolved_at, Some(5));
        assert_eq!(record.effective_value(), &json!(100));

        let err = record.resolve("user-2", json!(150), 6).unwrap_err();
        assert_eq!(err, Error::AlreadyResolved(record.conflict_id.clone()));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_op() -> impl Strategy<Value = ChangeOperation> {
            (
                prop_oneof![Just("a"), Just("b"), Just("c")],
                prop_oneof![Just("amount"), Just("memo")],
                0i64..4,
                proptest::collection::vec(0u64..3, 3),
                proptest::bool::weighted(0.15),
            )
                .prop_map(|(origin, field, value, counters, is_delete)| {
                    // Own counter is always ticked, so a replica never reuses a clock
                    // with a different value unless the generated counters collide.
                    let mut c: VectorClock = ["a", "b", "c"]
                        .iter()
                        .zip(counters)
                        .map(|(r, n)| (*r, n))
                        .collect();
                    c = c.tick(origin);
                    if is_delete {
                        delete(origin, c)
                    } else {
                        set(field, json!(value), origin, c)
                    }
                })
        }

        proptest! {
            #[test]
            fn prop_merge_commutative(x in arb_op(), y in arb_op()) {
                let engine = engine();
                let (vx, vy) = (x.to_version(), y.to_version());
                let xy = engine.merge(&vx, &vy, 0);
                let yx = engine.merge(&vy, &vx, 0);
                match (xy, yx) {
                    (Ok(xy), Ok(yx)) => prop_assert_eq!(xy.merged, yx.merged),
                    (Err(_), Err(_)) => {}
                    _ => prop_assert!(false, "merge succeeded in one order only"),
                }
            }

            #[test]
            fn prop_merge_idempotent(x in arb_op(), y in arb_op()) {
                let engine = engine();
                if let Ok(once) = engine.merge(&x.to_version(), &y.to_version(), 0) {
                    let twice = engine.merge(&once.merged, &y.to_version(), 0).unwrap();
                    prop_assert_eq!(&twice.merged, &once.merged);
                    prop_assert!(!twice.changed);
                }
            }

            #[test]
            fn prop_merge_associative(x in arb_op(), y in arb_op(), z in arb_op()) {
                let engine = engine();
                let (vx, vy, vz) = (x.to_version(), y.to_version(), z.to_version());
                let left = engine
                    .merge(&vx, &vy, 0)
                    .and_then(|xy| engine.merge(&xy.merged, &vz, 0));
                let right = engine
                    .merge(&vy, &vz, 0)
                    .and_then(|yz| engine.merge(&vx, &yz.merged, 0));
                if let (Ok(left), Ok(right)) = (left, right) {
                    prop_assert_eq!(left.merged, right.merged);
                }
            }
        }
    }
}
