//! Handshake handler - opens a sync session.

use concord_engine::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};

use crate::error::{AppError, Result};
use crate::AppState;

/// Check the protocol version and identity, then register the replica.
pub async fn handle_handshake(
    state: &AppState,
    replica_id: &str,
    request: HandshakeRequest,
) -> Result<HandshakeResponse> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(AppError::BadRequest(format!(
            "Unsupported protocol version {} (relay speaks {})",
            request.protocol_version, PROTOCOL_VERSION
        )));
    }
    if request.replica_id != replica_id {
        return Err(AppError::Unauthorized(format!(
            "Handshake for {} on a connection authenticated as {}",
            request.replica_id, replica_id
        )));
    }

    state.store.register_replica(replica_id).await?;
    let queue_depth = state.store.queue_depth_for(replica_id).await?;
    let session_id = uuid::Uuid::new_v4().to_string();

    tracing::info!(
        replica_id = %replica_id,
        session_id = %session_id,
        queue_depth,
        "Replica handshake"
    );

    Ok(HandshakeResponse {
        relay_id: state.config.relay_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        session_id,
        max_batch_size: state.config.max_batch_size,
        queue_depth,
    })
}
