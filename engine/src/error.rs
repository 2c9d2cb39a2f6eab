//! Error types for the Concord engine.

use crate::{ConflictId, EntityId, VectorClock};
use thiserror::Error;

/// All possible errors from the Concord engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Merge errors
    #[error("merge integrity violation on {entity_id}.{field}: equal clocks {clock} carry different values")]
    MergeIntegrity {
        entity_id: EntityId,
        field: String,
        clock: VectorClock,
    },

    #[error("cannot merge different entities: {local} vs {remote}")]
    EntityMismatch { local: EntityId, remote: EntityId },

    #[error("entity invariant violated for {entity_id}: {reason}")]
    InvariantViolation { entity_id: EntityId, reason: String },

    // Conflict errors
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    // Encoding errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl Error {
    /// True for errors that signal corrupted replica data rather than misuse.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Error::MergeIntegrity { .. } | Error::InvariantViolation { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
