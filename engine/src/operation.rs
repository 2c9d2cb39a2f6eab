//! Change operations.
//!
//! Local mutations are recorded as operations, never applied as direct
//! writes. An operation is immutable once appended to the change log and is
//! what travels (encrypted) between replicas.

use crate::{
    EntityId, EntityType, EntityVersion, FieldName, FieldValue, ReplicaId, Timestamp, VectorClock,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique, creation-time sortable identifier for an operation.
pub type OperationId = Ulid;

/// What an operation does to its entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpKind {
    /// Write one field.
    Set { field: FieldName, value: FieldValue },
    /// Soft-delete the whole entity.
    Delete,
}

/// An append-only log entry describing one local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOperation {
    /// Operation ID
    pub op_id: OperationId,
    /// Target entity
    pub entity_id: EntityId,
    /// Type of the target entity
    pub entity_type: EntityType,
    /// Field write or whole-entity delete
    pub kind: OpKind,
    /// Writer's clock after ticking its own counter
    pub clock_at_write: VectorClock,
    /// Replica that issued the operation
    pub origin_replica: ReplicaId,
    /// Writer's wall clock. Informational only
    #[serde(default)]
    pub written_at: Timestamp,
}

impl ChangeOperation {
    /// Create a field write.
    pub fn set(
        op_id: OperationId,
        entity_id: impl Into<EntityId>,
        entity_type: impl Into<EntityType>,
        field: impl Into<FieldName>,
        value: FieldValue,
        clock_at_write: VectorClock,
        origin_replica: impl Into<ReplicaId>,
    ) -> Self {
        Self {
            op_id,
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            kind: OpKind::Set {
                field: field.into(),
                value,
            },
            clock_at_write,
            origin_replica: origin_replica.into(),
            written_at: 0,
        }
    }

    /// Create a whole-entity delete.
    pub fn delete(
        op_id: OperationId,
        entity_id: impl Into<EntityId>,
        entity_type: impl Into<EntityType>,
        clock_at_write: VectorClock,
        origin_replica: impl Into<ReplicaId>,
    ) -> Self {
        Self {
            op_id,
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            kind: OpKind::Delete,
            clock_at_write,
            origin_replica: origin_replica.into(),
            written_at: 0,
        }
    }

    /// Stamp the writer's wall clock.
    pub fn at(mut self, written_at: Timestamp) -> Self {
        self.written_at = written_at;
        self
    }

    /// Field written by this operation, `None` for deletes.
    pub fn field_name(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Set { field, .. } => Some(field),
            OpKind::Delete => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete)
    }

    /// Lift the operation into a single-write entity version.
    ///
    /// Applying an operation is then just a merge with the local version.
    pub fn to_version(&self) -> EntityVersion {
        let version = EntityVersion::new(self.entity_id.clone(), self.entity_type.clone());
        match &self.kind {
            OpKind::Set { field, value } => version.with_field(
                field.clone(),
                value.clone(),
                self.origin_replica.clone(),
                self.clock_at_write.clone(),
            ),
            OpKind::Delete => version.with_tombstone(self.clock_at_write.clone()),
        }
    }
}
