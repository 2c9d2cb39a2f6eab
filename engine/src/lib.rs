//! # Concord Engine
//!
//! The deterministic merge core of a local-first sync system.
//!
//! Replicas mutate the same records offline and later exchange their
//! histories. This crate decides what the merged record looks like: the same
//! set of writes always produces byte-identical state, whatever order they
//! arrived in.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network or the wall clock;
//!   callers pass timestamps in
//! - **Deterministic**: same inputs, same outputs, on every replica
//! - **Field granularity**: concurrent edits to different fields both survive
//!
//! ## Core Concepts
//!
//! ### Vector clocks
//!
//! [`VectorClock`] stamps every write with one counter per replica.
//! Comparing two stamps yields a [`CausalOrder`]: `Before`, `After`, `Equal`,
//! or `Concurrent` when the writes raced.
//!
//! ### Entity versions
//!
//! An [`EntityVersion`] holds field values, a clock per field, and tombstone
//! state. Concurrent writes to one field are kept as siblings until a later
//! write supersedes them.
//!
//! ### Merging
//!
//! [`MergeEngine`] combines two versions of one entity field by field.
//! Racing writes produce a [`ConflictRecord`] plus a deterministic automatic
//! resolution chosen by the entity type's [`ResolutionRule`].
//!
//! ## Quick Start
//!
//! ```rust
//! use concord_engine::{ChangeOperation, MergeEngine, StrategyRegistry, VectorClock};
//! use serde_json::json;
//! use ulid::Ulid;
//!
//! let engine = MergeEngine::new(StrategyRegistry::default());
//! let base = VectorClock::new();
//!
//! // Two replicas edit the same field without seeing each other
//! let a = ChangeOperation::set(
//!     Ulid::new(), "txn-1", "transaction", "amount", json!(100), base.tick("a"), "a",
//! );
//! let b = ChangeOperation::set(
//!     Ulid::new(), "txn-1", "transaction", "amount", json!(150), base.tick("b"), "b",
//! );
//!
//! let first = engine.apply(None, &a, 0).unwrap();
//! let outcome = engine.apply(Some(&first.merged), &b, 0).unwrap();
//!
//! assert_eq!(outcome.conflicts.len(), 1);
//! assert_eq!(outcome.conflicts[0].field_name, "amount");
//! ```
//!
//! ## Persistence
//!
//! [`ReplicaSnapshot`] serializes a replica's entities with deterministic
//! ordering and exposes a digest for convergence checks.

pub mod clock;
pub mod entity;
pub mod error;
pub mod merge;
pub mod operation;
pub mod protocol;
pub mod snapshot;
pub mod strategy;

// Re-export main types at crate root
pub use clock::{CausalOrder, VectorClock};
pub use entity::{Candidate, EntityVersion};
pub use error::Error;
pub use merge::{ConflictRecord, MergeEngine, MergeOutcome};
pub use operation::{ChangeOperation, OpKind, OperationId};
pub use protocol::{
    ClientMessage, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, RejectedEnvelope, ServerMessage, SyncEnvelope, PROTOCOL_VERSION,
    REPLICA_ID_HEADER,
};
pub use snapshot::{ReplicaSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use strategy::{
    ConflictResolver, EntityTypeDef, FieldDef, FieldKind, LineUnionMerge, ResolutionRule,
    StrategyRegistry, TextMerge,
};

/// Type aliases for clarity
pub type ReplicaId = String;
pub type EntityId = String;
pub type EntityType = String;
pub type FieldName = String;
pub type FieldValue = serde_json::Value;
pub type ConflictId = String;
pub type UserId = String;
/// Milliseconds since the Unix epoch. Informational only: never compared
/// across replicas.
pub type Timestamp = u64;
