//! Push handler - accepts envelopes from a replica.

use concord_engine::{PushRequest, PushResponse, RejectedEnvelope, ServerMessage, SyncEnvelope};

use crate::error::{AppError, Result};
use crate::AppState;

/// Why an envelope cannot be stored, if it cannot.
fn validate(envelope: &SyncEnvelope, replica_id: &str) -> Option<&'static str> {
    if envelope.origin_replica != replica_id {
        Some("origin replica does not match the pushing replica")
    } else if envelope.entity_id.is_empty() {
        Some("missing entity id")
    } else if envelope.encrypted_payload.is_empty() {
        Some("empty payload")
    } else if envelope.clock.get(replica_id) == 0 {
        Some("clock has no entry for the origin replica")
    } else {
        None
    }
}

/// Process a push request from a replica.
///
/// Refuses the whole batch while the pushing replica's own backlog is over
/// the limit, so a replica far behind catches up before adding more. Other
/// replicas, online or not, never hold back its pushes. Already stored op
/// ids are acknowledged again so a replica that lost an ack can retry
/// safely.
pub async fn handle_push(
    state: &AppState,
    replica_id: &str,
    request: PushRequest,
) -> Result<PushResponse> {
    if request.envelopes.len() > state.config.max_batch_size {
        return Err(AppError::BadRequest(format!(
            "Batch of {} exceeds the limit of {}",
            request.envelopes.len(),
            state.config.max_batch_size
        )));
    }

    let queue_depth = state.store.queue_depth_for(replica_id).await?;
    if queue_depth > state.config.queue_depth_limit {
        tracing::warn!(
            replica_id = %replica_id,
            queue_depth,
            limit = state.config.queue_depth_limit,
            "Refusing push under backpressure"
        );
        return Err(AppError::Backpressure { queue_depth });
    }

    let mut rejected = Vec::new();
    let mut valid = Vec::with_capacity(request.envelopes.len());
    for envelope in request.envelopes {
        match validate(&envelope, replica_id) {
            Some(reason) => rejected.push(RejectedEnvelope {
                op_id: envelope.op_id,
                reason: reason.to_string(),
            }),
            None => valid.push(envelope),
        }
    }

    let outcome = state.store.append(&valid).await?;

    if !outcome.stored.is_empty() {
        let sent = state.conn_manager.broadcast_except_replica(
            replica_id,
            ServerMessage::EnvelopesAvailable {
                origin_replica: replica_id.to_string(),
                count: outcome.stored.len(),
            },
        );
        tracing::debug!(
            replica_id = %replica_id,
            stored = outcome.stored.len(),
            notified = sent,
            "Notified connected replicas"
        );
    }

    tracing::info!(
        replica_id = %replica_id,
        stored = outcome.stored.len(),
        duplicates = outcome.duplicates.len(),
        rejected = rejected.len(),
        "Processed push"
    );

    Ok(PushResponse {
        acknowledged: valid.iter().map(|envelope| envelope.op_id).collect(),
        rejected,
        queue_depth,
    })
}
