//! Entity versions: the unit of sync.
//!
//! An entity is a record (a transaction, an invoice) made of named fields.
//! Each field carries its own vector clock so two replicas editing different
//! fields of the same entity never overwrite each other.

use crate::{
    clock::CausalOrder, EntityId, EntityType, Error, FieldName, FieldValue, ReplicaId,
    VectorClock,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Canonical byte encoding of a field value.
///
/// Object keys are emitted in sorted order, so equal values always produce
/// identical bytes.
pub fn canonical_bytes(value: &FieldValue) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// SHA-256 of a value's canonical bytes, hex encoded.
pub fn value_digest(value: &FieldValue) -> String {
    hex::encode(Sha256::digest(canonical_bytes(value)))
}

/// One write competing for a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Replica that wrote the value
    pub origin_replica: ReplicaId,
    /// The written value
    pub value: FieldValue,
    /// Clock of the write
    pub clock: VectorClock,
}

impl Candidate {
    pub fn new(
        origin_replica: impl Into<ReplicaId>,
        value: FieldValue,
        clock: VectorClock,
    ) -> Self {
        Self {
            origin_replica: origin_replica.into(),
            value,
            clock,
        }
    }

    /// Sort key giving every replica the same candidate order.
    fn canonical_key(&self) -> (ReplicaId, Vec<(ReplicaId, u64)>, String) {
        (
            self.origin_replica.clone(),
            self.clock.iter().map(|(r, c)| (r.clone(), c)).collect(),
            value_digest(&self.value),
        )
    }
}

/// Sort candidates into the canonical order shared by all replicas.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_cached_key(Candidate::canonical_key);
}

/// A version of one entity as known by a replica.
///
/// Invariants:
/// - every key of `fields` has an entry in `field_clocks` and `field_origins`
/// - `siblings[f]`, when present, holds two or more mutually concurrent
///   candidates; `field_clocks[f]` is their pointwise max and `fields[f]` is
///   their deterministic resolution
/// - `tombstone` is true iff `tombstone_clock` is set and no single write
///   (a sibling, or the field clock of an uncontested field) is strictly
///   after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersion {
    /// Stable identifier, immutable for the entity's lifetime
    pub entity_id: EntityId,
    /// Tag selecting the merge strategy
    pub entity_type: EntityType,
    /// Materialized field values
    pub fields: BTreeMap<FieldName, FieldValue>,
    /// Causal stamp per field
    pub field_clocks: BTreeMap<FieldName, VectorClock>,
    /// Writer of each materialized value
    pub field_origins: BTreeMap<FieldName, ReplicaId>,
    /// Concurrent writes still competing for a field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub siblings: BTreeMap<FieldName, Vec<Candidate>>,
    /// Soft delete flag
    pub tombstone: bool,
    /// Pointwise max of every delete observed
    pub tombstone_clock: Option<VectorClock>,
}

impl EntityVersion {
    /// Create an empty, live entity.
    pub fn new(entity_id: impl Into<EntityId>, entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            field_clocks: BTreeMap::new(),
            field_origins: BTreeMap::new(),
            siblings: BTreeMap::new(),
            tombstone: false,
            tombstone_clock: None,
        }
    }

    /// Builder-style single-writer field assignment. Intended for fixtures
    /// and for lifting operations into versions.
    pub fn with_field(
        mut self,
        field: impl Into<FieldName>,
        value: FieldValue,
        origin: impl Into<ReplicaId>,
        clock: VectorClock,
    ) -> Self {
        let field = field.into();
        self.siblings.remove(&field);
        self.fields.insert(field.clone(), value);
        self.field_clocks.insert(field.clone(), clock);
        self.field_origins.insert(field, origin.into());
        self.refresh_tombstone();
        self
    }

    /// Builder-style delete.
    pub fn with_tombstone(mut self, clock: VectorClock) -> Self {
        self.tombstone_clock = Some(match self.tombstone_clock.take() {
            Some(existing) => existing.merge(&clock),
            None => clock,
        });
        self.refresh_tombstone();
        self
    }

    /// Check if the entity is visible to active queries.
    pub fn is_active(&self) -> bool {
        !self.tombstone
    }

    /// Materialized value of a field.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Every write currently competing for a field, in canonical order.
    ///
    /// A field with a single writer yields one candidate.
    pub fn candidates(&self, field: &str) -> Vec<Candidate> {
        if let Some(siblings) = self.siblings.get(field) {
            return siblings.clone();
        }
        match (
            self.fields.get(field),
            self.field_clocks.get(field),
            self.field_origins.get(field),
        ) {
            (Some(value), Some(clock), Some(origin)) => {
                vec![Candidate::new(origin.clone(), value.clone(), clock.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// Fields whose concurrent writes have not been superseded yet.
    pub fn contested_fields(&self) -> impl Iterator<Item = &FieldName> {
        self.siblings.keys()
    }

    /// Pointwise max of every clock the entity carries.
    pub fn version_clock(&self) -> VectorClock {
        let fields = self
            .field_clocks
            .values()
            .fold(VectorClock::new(), |acc, c| acc.merge(c));
        match &self.tombstone_clock {
            Some(t) => fields.merge(t),
            None => fields,
        }
    }

    /// Clocks of the individual writes held for each field.
    ///
    /// A contested field contributes one clock per sibling rather than
    /// their join.
    fn write_clocks(&self) -> impl Iterator<Item = &VectorClock> {
        self.field_clocks.iter().flat_map(move |(field, joined)| {
            match self.siblings.get(field) {
                Some(siblings) => siblings.iter().map(|c| &c.clock).collect::<Vec<_>>(),
                None => vec![joined],
            }
        })
    }

    /// Recompute `tombstone` from the clocks.
    ///
    /// A delete wins over every edit it is concurrent with or after; only a
    /// single write made after observing every delete brings the entity
    /// back.
    pub(crate) fn refresh_tombstone(&mut self) {
        self.tombstone = match &self.tombstone_clock {
            None => false,
            Some(t) => !self.write_clocks().any(|c| c.compare(t) == CausalOrder::After),
        };
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> crate::error::Result<()> {
        let violation = |reason: String| Error::InvariantViolation {
            entity_id: self.entity_id.clone(),
            reason,
        };

        for field in self.fields.keys() {
            if !self.field_clocks.contains_key(field) {
                return Err(violation(format!("field '{field}' has no clock")));
            }
            if !self.field_origins.contains_key(field) {
                return Err(violation(format!("field '{field}' has no origin")));
            }
        }
        for (field, siblings) in &self.siblings {
            if siblings.len() < 2 {
                return Err(violation(format!(
                    "field '{field}' stores fewer than two siblings"
                )));
            }
            let joined = siblings
                .iter()
                .fold(VectorClock::new(), |acc, c| acc.merge(&c.clock));
            if self.field_clocks.get(field) != Some(&joined) {
                return Err(violation(format!(
                    "field '{field}' clock is not the join of its siblings"
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }
}
