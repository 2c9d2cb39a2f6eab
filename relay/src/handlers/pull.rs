//! Pull handler - serves envelopes from other replicas.

use concord_engine::{PullRequest, PullResponse};

use crate::error::Result;
use crate::AppState;

/// Process a pull request from a replica.
///
/// Pulling from a cursor confirms delivery of everything up to it, which is
/// what drains the replica's share of the relay backlog.
pub async fn handle_pull(
    state: &AppState,
    replica_id: &str,
    request: PullRequest,
) -> Result<PullResponse> {
    let max = state.config.max_batch_size.max(1);
    let limit = request.limit.map(|l| l.clamp(1, max)).unwrap_or(max);

    state
        .store
        .record_delivery(replica_id, request.cursor.as_ref())
        .await?;
    let page = state
        .store
        .fetch_after(request.cursor.as_ref(), replica_id, limit)
        .await?;
    let backlog = state.store.queue_depth_for(replica_id).await?;
    let queue_depth = backlog.saturating_sub(page.envelopes.len() as u64);

    tracing::debug!(
        replica_id = %replica_id,
        returned = page.envelopes.len(),
        has_more = page.has_more,
        queue_depth,
        "Served pull"
    );

    Ok(PullResponse {
        envelopes: page.envelopes,
        cursor: page.cursor,
        has_more: page.has_more,
        queue_depth,
    })
}
