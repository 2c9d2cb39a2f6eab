//! Snapshots of replica state.
//!
//! A snapshot captures every entity a replica knows, with deterministic
//! serialization so two replicas that converged produce identical bytes.

use crate::{error::Result, EntityId, EntityVersion, Error, ReplicaId, VectorClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a replica.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Replica the snapshot was taken on
    pub replica_id: ReplicaId,
    /// Replica clock at snapshot time
    pub clock: VectorClock,
    /// All entities keyed by id, tombstoned ones included
    pub entities: BTreeMap<EntityId, EntityVersion>,
}

impl ReplicaSnapshot {
    /// Create a new empty snapshot.
    pub fn new(replica_id: impl Into<ReplicaId>, clock: VectorClock) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            replica_id: replica_id.into(),
            clock,
            entities: BTreeMap::new(),
        }
    }

    /// Add an entity to the snapshot.
    pub fn add_entity(&mut self, entity: EntityVersion) {
        self.entities.insert(entity.entity_id.clone(), entity);
    }

    pub fn get_entity(&self, id: &str) -> Option<&EntityVersion> {
        self.entities.get(id)
    }

    /// Count active (non-deleted) entities.
    pub fn active_entity_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_active()).count()
    }

    /// Check every entity's invariants.
    pub fn validate(&self) -> Result<()> {
        for (id, entity) in &self.entities {
            if *id != entity.entity_id {
                return Err(Error::InvalidSnapshot(format!(
                    "entity stored under '{id}' claims id '{}'",
                    entity.entity_id
                )));
            }
            entity.validate()?;
        }
        Ok(())
    }

    /// SHA-256 over the entities only, hex encoded.
    ///
    /// Replica ids and clocks differ between replicas even when their data
    /// converged, so they are left out.
    pub fn entities_digest(&self) -> Result<String> {
        let bytes =
            serde_json::to_vec(&self.entities).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}
