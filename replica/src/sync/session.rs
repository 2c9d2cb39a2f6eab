//! One replica's sync session with one relay.

use super::ConnectionState;
use crate::error::{ReplicaError, Result};
use crate::now_ms;
use crate::replica::{ApplyReport, Replica};
use crate::storage::{get_json, ns, put_json};
use crate::transport::RelayTransport;
use concord_engine::{
    HandshakeRequest, HandshakeResponse, OperationId, PullRequest, PushRequest, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delta-sync bookmarks for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Relay position up to which remote operations are persisted locally
    pub last_received_op_id: Option<OperationId>,
    /// Newest local operation such that it and all older ones are acknowledged
    pub last_acked_op_id: Option<OperationId>,
}

/// Summary of one sync round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub pulled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub quarantined: usize,
    /// Envelopes left for redelivery after a local write failure
    pub failed: usize,
    pub pushed: usize,
    pub acknowledged: usize,
    pub rejected: usize,
    /// Backlog the relay reported in its latest response of the round
    pub queue_depth: u64,
    /// Reported backlog above the configured threshold
    pub backpressure: bool,
    pub failure: Option<String>,
}

impl RoundReport {
    /// Nothing left behind: the driver can go back to its normal cadence.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.rejected == 0 && !self.backpressure
    }

    fn absorb(&mut self, applied: &ApplyReport) {
        self.applied += applied.applied;
        self.duplicates += applied.duplicates;
        self.conflicts += applied.conflicts;
        self.quarantined += applied.quarantined;
        self.failed += applied.failed;
        if applied.failure.is_some() {
            self.failure.clone_from(&applied.failure);
        }
    }
}

/// Runs sync rounds against one relay.
///
/// Cursors are persisted per peer and only move forward after the work they
/// cover is durable: the received cursor after the pulled batch is applied
/// and stored, the acked cursor after the relay acknowledged the push and
/// the acknowledgement is stored. An interrupted round therefore repeats
/// work on resume instead of skipping it.
pub struct SyncSession {
    replica: Arc<Replica>,
    transport: Arc<dyn RelayTransport>,
    peer: String,
    state: ConnectionState,
    cursor: SyncCursor,
    batch_size: usize,
    relay: Option<HandshakeResponse>,
}

impl SyncSession {
    /// Open a session, restoring the peer's persisted cursor.
    pub async fn open(
        replica: Arc<Replica>,
        transport: Arc<dyn RelayTransport>,
        peer: impl Into<String>,
    ) -> Result<Self> {
        let peer = peer.into();
        let cursor = get_json(replica.documents(), ns::CURSORS, &peer)
            .await?
            .unwrap_or_default();
        let batch_size = replica.config().sync.batch_size;
        replica
            .health_registry()
            .set_state(&peer, ConnectionState::Disconnected);

        Ok(Self {
            replica,
            transport,
            peer,
            state: ConnectionState::Disconnected,
            cursor,
            batch_size,
            relay: None,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// Relay details from the last handshake.
    pub fn relay(&self) -> Option<&HandshakeResponse> {
        self.relay.as_ref()
    }

    fn set_state(&mut self, next: ConnectionState) -> Result<()> {
        self.state.transition(next)?;
        self.replica.health_registry().set_state(&self.peer, next);
        Ok(())
    }

    /// Drop the connection. The next round handshakes again.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.relay = None;
        self.replica
            .health_registry()
            .set_state(&self.peer, ConnectionState::Disconnected);
    }

    /// Record a failed round and drop the connection.
    pub fn abort(&mut self, error: &ReplicaError) {
        warn!(peer = %self.peer, state = %self.state, error = %error, "Sync round failed");
        self.replica.health_registry().record_error(&self.peer, error);
        self.disconnect();
    }

    /// Run one round: connect if needed, pull until caught up, push pending
    /// local operations.
    pub async fn run_round(&mut self) -> Result<RoundReport> {
        match self.round().await {
            Ok(report) => {
                let health = self.replica.health_registry();
                match &report.failure {
                    Some(failure) => health.record_error(
                        &self.peer,
                        &ReplicaError::persistence("apply remote batch", failure),
                    ),
                    None => health.record_round(&self.peer, report.queue_depth, now_ms()),
                }
                Ok(report)
            }
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    async fn round(&mut self) -> Result<RoundReport> {
        if !self.state.is_connected() {
            self.connect().await?;
        }
        self.set_state(ConnectionState::Syncing)?;

        let mut report = RoundReport::default();
        self.pull(&mut report).await?;

        let threshold = self.replica.config().sync.queue_depth_threshold;
        if report.queue_depth > threshold {
            report.backpressure = true;
        } else {
            self.push(&mut report, threshold).await?;
        }

        self.set_state(ConnectionState::Idle)?;
        info!(
            peer = %self.peer,
            pulled = report.pulled,
            applied = report.applied,
            conflicts = report.conflicts,
            pushed = report.pushed,
            acknowledged = report.acknowledged,
            queue_depth = report.queue_depth,
            "Sync round complete"
        );
        Ok(report)
    }

    async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Handshaking)?;
        let response = self
            .transport
            .handshake(HandshakeRequest {
                replica_id: self.replica.replica_id().clone(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;

        if response.protocol_version != PROTOCOL_VERSION {
            return Err(ReplicaError::Protocol(format!(
                "relay speaks protocol {}, replica speaks {PROTOCOL_VERSION}",
                response.protocol_version
            )));
        }

        self.batch_size = self
            .replica
            .config()
            .sync
            .batch_size
            .min(response.max_batch_size.max(1));
        self.replica
            .health_registry()
            .set_relay(&self.peer, &response.relay_id);
        info!(
            peer = %self.peer,
            relay_id = %response.relay_id,
            session_id = %response.session_id,
            queue_depth = response.queue_depth,
            "Connected to relay"
        );
        self.relay = Some(response);
        self.set_state(ConnectionState::Authenticated)
    }

    async fn pull(&mut self, report: &mut RoundReport) -> Result<()> {
        loop {
            let before = self.cursor.last_received_op_id;
            let response = self
                .transport
                .pull(PullRequest {
                    cursor: before,
                    limit: Some(self.batch_size),
                })
                .await?;
            report.pulled += response.envelopes.len();
            report.queue_depth = response.queue_depth;

            let applied = self.replica.apply_envelopes(&response.envelopes).await?;
            report.absorb(&applied);

            let next = if applied.is_complete() {
                response.cursor.or(before)
            } else {
                applied.contiguous_through.or(before)
            };
            if next != before {
                self.cursor.last_received_op_id = next;
                self.save_cursor().await?;
            }

            debug!(
                peer = %self.peer,
                envelopes = response.envelopes.len(),
                has_more = response.has_more,
                "Pulled batch"
            );
            if !applied.is_complete() || !response.has_more || next == before {
                return Ok(());
            }
        }
    }

    async fn push(&mut self, report: &mut RoundReport, threshold: u64) -> Result<()> {
        loop {
            let pending = self
                .replica
                .change_log()
                .pending_after(self.cursor.last_acked_op_id, self.batch_size)
                .await?;
            if pending.is_empty() {
                return Ok(());
            }

            let envelopes = pending
                .iter()
                .map(|op| self.replica.seal(op))
                .collect::<Result<Vec<_>>>()?;
            report.pushed += envelopes.len();

            let response = self.transport.push(PushRequest { envelopes }).await?;
            report.queue_depth = response.queue_depth;
            self.replica
                .change_log()
                .mark_acknowledged(&response.acknowledged)
                .await?;
            report.acknowledged += response.acknowledged.len();

            let acked: HashSet<&OperationId> = response.acknowledged.iter().collect();
            let prefix: Vec<OperationId> = pending
                .iter()
                .map(|op| op.op_id)
                .take_while(|id| acked.contains(id))
                .collect();
            if let Some(last) = prefix.last() {
                self.cursor.last_acked_op_id = Some(*last);
                self.save_cursor().await?;
            }

            for rejected in &response.rejected {
                warn!(
                    peer = %self.peer,
                    op_id = %rejected.op_id,
                    reason = %rejected.reason,
                    "Relay rejected operation"
                );
            }
            report.rejected += response.rejected.len();

            if response.queue_depth > threshold {
                report.backpressure = true;
                return Ok(());
            }
            if prefix.len() < pending.len() {
                return Ok(());
            }
        }
    }

    async fn save_cursor(&self) -> Result<()> {
        put_json(
            self.replica.documents(),
            self.replica.retry_policy(),
            ns::CURSORS,
            &self.peer,
            &self.cursor,
        )
        .await
    }
}
