//! Envelope storage.
//!
//! The relay keeps every envelope it accepts in arrival order and tracks,
//! per replica, how far that replica has pulled. Cursors handed to replicas
//! are op ids; the store resolves them to arrival positions. A cursor the
//! store does not know resolves to the beginning of the log.

mod memory;
mod postgres;

pub use memory::MemoryEnvelopeStore;
pub use postgres::{create_pool, run_migrations, PgEnvelopeStore, Pool};

use crate::error::Result;
use async_trait::async_trait;
use concord_engine::{OperationId, SyncEnvelope};
use serde::Serialize;
use std::time::Duration;

/// Result of storing a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Newly stored, in batch order
    pub stored: Vec<OperationId>,
    /// Already present from an earlier push
    pub duplicates: Vec<OperationId>,
}

/// One page of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopePage {
    /// Envelopes from other replicas
    pub envelopes: Vec<SyncEnvelope>,
    /// Last position scanned, including the requester's own envelopes
    pub cursor: Option<OperationId>,
    pub has_more: bool,
}

/// Relay-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub envelopes: u64,
    pub replicas: u64,
}

/// Durable envelope log shared by every connection.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Store envelopes not seen before. Idempotent per op id.
    async fn append(&self, envelopes: &[SyncEnvelope]) -> Result<AppendOutcome>;

    /// Scan up to `limit` envelopes after `cursor`, skipping the requester's
    /// own.
    async fn fetch_after(
        &self,
        cursor: Option<&OperationId>,
        requester: &str,
        limit: usize,
    ) -> Result<EnvelopePage>;

    /// Make a replica known without moving its delivery position. Marks
    /// it as seen.
    async fn register_replica(&self, replica_id: &str) -> Result<()>;

    /// A pull from `cursor` confirms everything up to it was received.
    /// Marks the replica as seen.
    async fn record_delivery(&self, replica_id: &str, cursor: Option<&OperationId>) -> Result<()>;

    /// Envelopes from other replicas past this replica's delivery position.
    async fn queue_depth_for(&self, replica_id: &str) -> Result<u64>;

    /// Largest backlog among replicas seen within `active_within`.
    async fn queue_depth(&self, active_within: Duration) -> Result<u64>;

    async fn stats(&self) -> Result<StoreStats>;
}
