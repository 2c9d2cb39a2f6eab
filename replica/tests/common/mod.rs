//! Shared fixtures: replicas over in-memory stores and a relay running in
//! the same process.

#![allow(dead_code)]

use async_trait::async_trait;
use concord_engine::{
    EntityTypeDef, FieldDef, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse,
    PushRequest, PushResponse, StrategyRegistry,
};
use concord_relay::handlers::{handle_handshake, handle_pull, handle_push};
use concord_relay::{AppError, AppState, Config};
use concord_replica::{
    AesGcmCipher, DocumentStore, MemoryStore, RelayTransport, Replica, ReplicaConfig,
    ReplicaError, Result, SyncSession, SyncTuning,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const KEY: [u8; 32] = [7; 32];

pub fn registry() -> StrategyRegistry {
    StrategyRegistry::new().with_type(
        EntityTypeDef::new("transaction")
            .with_field(FieldDef::value("amount"))
            .with_field(FieldDef::text("memo")),
    )
}

pub async fn open_replica(
    id: &str,
    docs: Arc<dyn DocumentStore>,
    tuning: SyncTuning,
) -> Arc<Replica> {
    let config = ReplicaConfig::new(id).with_sync(tuning);
    Arc::new(
        Replica::open(config, docs, registry(), Arc::new(AesGcmCipher::new(&KEY)))
            .await
            .unwrap(),
    )
}

/// A replica on a fresh in-memory store, plus the store for fault injection.
pub async fn replica(id: &str) -> (Arc<Replica>, Arc<MemoryStore>) {
    let docs = Arc::new(MemoryStore::new());
    let replica = open_replica(id, docs.clone(), SyncTuning::testing()).await;
    (replica, docs)
}

pub fn relay(config: Config) -> AppState {
    AppState::in_memory(config)
}

pub async fn session(replica: &Arc<Replica>, relay: &AppState) -> SyncSession {
    let transport = Arc::new(InProcessRelay::new(relay.clone(), replica.replica_id()));
    SyncSession::open(replica.clone(), transport, "relay").await.unwrap()
}

/// Calls the relay's handlers directly, as the HTTP routes would.
pub struct InProcessRelay {
    state: AppState,
    replica_id: String,
}

impl InProcessRelay {
    pub fn new(state: AppState, replica_id: &str) -> Self {
        Self {
            state,
            replica_id: replica_id.to_string(),
        }
    }
}

fn into_replica_error(error: AppError) -> ReplicaError {
    match error {
        AppError::Backpressure { queue_depth } => ReplicaError::Backpressure { queue_depth },
        AppError::BadRequest(message) | AppError::Unauthorized(message) => {
            ReplicaError::Protocol(message)
        }
        other => ReplicaError::Transport {
            message: other.to_string(),
            status: Some(500),
        },
    }
}

#[async_trait]
impl RelayTransport for InProcessRelay {
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        handle_handshake(&self.state, &self.replica_id, request)
            .await
            .map_err(into_replica_error)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        handle_pull(&self.state, &self.replica_id, request)
            .await
            .map_err(into_replica_error)
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        handle_push(&self.state, &self.replica_id, request)
            .await
            .map_err(into_replica_error)
    }
}

pub async fn digest(replica: &Replica) -> String {
    replica
        .export_state()
        .await
        .unwrap()
        .entities_digest()
        .unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
