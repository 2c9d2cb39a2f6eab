//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub relay_id: String,
    pub envelopes: u64,
    pub replicas: u64,
    /// Largest backlog among recently seen replicas
    pub queue_depth: u64,
    pub queue_depth_limit: u64,
    pub connections: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let stats = state.store.stats().await?;
    let queue_depth = state.store.queue_depth(state.config.replica_idle()).await?;
    let status = if queue_depth > state.config.queue_depth_limit {
        "backpressure"
    } else {
        "ok"
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        relay_id: state.config.relay_id.clone(),
        envelopes: stats.envelopes,
        replicas: stats.replicas,
        queue_depth,
        queue_depth_limit: state.config.queue_depth_limit,
        connections: state.conn_manager.connection_count(),
    }))
}

async fn root() -> &'static str {
    "Concord Relay"
}
