//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use concord_engine::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
};

use crate::auth::AuthReplica;
use crate::error::Result;
use crate::handlers::{handle_handshake, handle_pull, handle_push};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/handshake", post(handshake_handler))
        .route("/sync", get(pull_handler).post(push_handler))
}

/// POST /handshake - Open a sync session.
async fn handshake_handler(
    State(state): State<AppState>,
    auth: AuthReplica,
    Json(request): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>> {
    let response = handle_handshake(&state, &auth.replica_id, request).await?;
    Ok(Json(response))
}

/// POST /sync - Push envelopes to the relay.
async fn push_handler(
    State(state): State<AppState>,
    auth: AuthReplica,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(&state, &auth.replica_id, request).await?;
    Ok(Json(response))
}

/// GET /sync - Pull envelopes from other replicas.
async fn pull_handler(
    State(state): State<AppState>,
    auth: AuthReplica,
    Query(request): Query<PullRequest>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(&state, &auth.replica_id, request).await?;
    Ok(Json(response))
}
