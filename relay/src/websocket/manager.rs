//! WebSocket connection manager.
//!
//! Tracks open sockets per replica so pushes can be announced to everyone
//! else.

use std::sync::Arc;

use concord_engine::{ReplicaId, ServerMessage};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub replica_id: ReplicaId,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    /// Connection ids per replica. A replica may hold several sockets.
    by_replica: DashMap<ReplicaId, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection and return its id.
    pub fn register(&self, replica_id: ReplicaId, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                replica_id: replica_id.clone(),
                sender,
            },
        );
        self.by_replica
            .entry(replica_id)
            .or_default()
            .push(conn_id.clone());

        tracing::debug!(conn_id = %conn_id, "WebSocket connection registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return;
        };

        let now_empty = match self.by_replica.get_mut(&conn.replica_id) {
            Some(mut conn_ids) => {
                conn_ids.retain(|id| id != conn_id);
                conn_ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_replica
                .remove_if(&conn.replica_id, |_, ids| ids.is_empty());
        }

        tracing::debug!(
            conn_id = %conn_id,
            replica_id = %conn.replica_id,
            "WebSocket connection unregistered"
        );
    }

    /// Send to every connection not belonging to `replica_id`.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_except_replica(&self, replica_id: &str, message: ServerMessage) -> usize {
        let sent = self
            .connections
            .iter()
            .filter(|entry| entry.value().replica_id != replica_id)
            .filter(|entry| entry.value().sender.send(message.clone()).is_ok())
            .count();

        tracing::debug!(
            origin = %replica_id,
            recipients = sent,
            "Broadcast message to connections"
        );
        sent
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct replicas with at least one open socket.
    pub fn replica_count(&self) -> usize {
        self.by_replica.len()
    }
}
