//! Pollable health counters.
//!
//! Nothing here alerts; a monitoring collaborator polls
//! [`Replica::health`](crate::Replica::health) and decides.

use crate::error::ReplicaError;
use crate::sync::ConnectionState;
use concord_engine::{ReplicaId, Timestamp};
use dashmap::DashMap;
use serde::Serialize;

/// Sync statistics for one relay peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub peer: String,
    pub relay_id: Option<String>,
    pub connection_state: ConnectionState,
    /// Backlog the relay last reported for this replica
    pub queue_depth: u64,
    /// Wall-clock time of the last successful round
    pub last_sync_timestamp: Option<Timestamp>,
    /// Rounds attempted, failed ones included
    pub rounds: u64,
    pub errors: u64,
    /// `errors / rounds`, zero before the first round
    pub sync_error_rate: f64,
    pub last_error: Option<String>,
    /// Last error needs an operator rather than a retry
    pub last_error_actionable: bool,
}

/// Replica-wide health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub replica_id: ReplicaId,
    pub unresolved_conflict_count: usize,
    /// Local operations the relay has not acknowledged
    pub pending_operations: usize,
    pub quarantined_operations: usize,
    pub peers: Vec<PeerHealth>,
}

/// Per-peer counters updated by sync sessions.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    peers: DashMap<String, PeerHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_peer(&self, peer: &str, update: impl FnOnce(&mut PeerHealth)) {
        let mut entry = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerHealth {
                peer: peer.to_string(),
                ..PeerHealth::default()
            });
        update(entry.value_mut());
    }

    pub fn set_state(&self, peer: &str, state: ConnectionState) {
        self.with_peer(peer, |h| h.connection_state = state);
    }

    pub fn set_relay(&self, peer: &str, relay_id: &str) {
        self.with_peer(peer, |h| h.relay_id = Some(relay_id.to_string()));
    }

    pub fn record_round(&self, peer: &str, queue_depth: u64, now: Timestamp) {
        self.with_peer(peer, |h| {
            h.rounds += 1;
            h.queue_depth = queue_depth;
            h.last_sync_timestamp = Some(now);
            h.sync_error_rate = error_rate(h.errors, h.rounds);
        });
    }

    pub fn record_error(&self, peer: &str, error: &ReplicaError) {
        self.with_peer(peer, |h| {
            h.rounds += 1;
            h.errors += 1;
            if let ReplicaError::Backpressure { queue_depth } = error {
                h.queue_depth = *queue_depth;
            }
            h.last_error = Some(error.to_string());
            h.last_error_actionable = error.is_actionable();
            h.sync_error_rate = error_rate(h.errors, h.rounds);
        });
    }

    pub fn peer(&self, peer: &str) -> Option<PeerHealth> {
        self.peers.get(peer).map(|h| h.value().clone())
    }

    /// Every peer, ordered by name.
    pub fn peers(&self) -> Vec<PeerHealth> {
        let mut peers: Vec<PeerHealth> = self.peers.iter().map(|h| h.value().clone()).collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }
}

fn error_rate(errors: u64, rounds: u64) -> f64 {
    if rounds == 0 {
        0.0
    } else {
        errors as f64 / rounds as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_tracks_rounds() {
        let health = HealthRegistry::new();
        health.record_round("relay", 3, 1_000);
        health.record_round("relay", 0, 2_000);
        health.record_error("relay", &ReplicaError::transport("connection refused"));
        health.record_round("relay", 0, 3_000);

        let peer = health.peer("relay").unwrap();
        assert_eq!(peer.rounds, 4);
        assert_eq!(peer.errors, 1);
        assert_eq!(peer.sync_error_rate, 0.25);
        assert_eq!(peer.last_sync_timestamp, Some(3_000));
        assert!(peer.last_error_actionable);
    }

    #[test]
    fn backpressure_updates_queue_depth() {
        let health = HealthRegistry::new();
        health.record_error("relay", &ReplicaError::Backpressure { queue_depth: 4_000 });
        let peer = health.peer("relay").unwrap();
        assert_eq!(peer.queue_depth, 4_000);
        assert!(!peer.last_error_actionable);
    }

    #[test]
    fn peers_are_sorted() {
        let health = HealthRegistry::new();
        health.set_state("b", ConnectionState::Idle);
        health.set_state("a", ConnectionState::Handshaking);
        health.set_relay("a", "relay-1");

        let peers = health.peers();
        assert_eq!(peers[0].peer, "a");
        assert_eq!(peers[0].relay_id.as_deref(), Some("relay-1"));
        assert_eq!(peers[1].connection_state, ConnectionState::Idle);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = HealthSnapshot {
            replica_id: "device-1".into(),
            unresolved_conflict_count: 2,
            pending_operations: 5,
            quarantined_operations: 0,
            peers: vec![],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["unresolvedConflictCount"], 2);
        assert_eq!(json["pendingOperations"], 5);
    }
}
