//! Wire types shared by replicas and the relay.
//!
//! The relay only ever sees [`SyncEnvelope`] metadata; the operation itself
//! travels inside `encrypted_payload`. HTTP bodies use camelCase, websocket
//! messages are tagged with `type` and use snake_case like the rest of the
//! websocket channel.

use crate::{EntityId, OperationId, ReplicaId, VectorClock};
use serde::{Deserialize, Serialize};

/// Version of the sync wire protocol. Checked during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// HTTP header naming the calling replica. The bearer token is checked
/// against it.
pub const REPLICA_ID_HEADER: &str = "x-concord-replica";

/// An encrypted change operation as stored and forwarded by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub entity_id: EntityId,
    pub op_id: OperationId,
    pub origin_replica: ReplicaId,
    pub clock: VectorClock,
    /// Opaque to the relay
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
}

/// Base64 encoding for binary payloads on JSON wires.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// First message of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub replica_id: ReplicaId,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub relay_id: String,
    pub protocol_version: u32,
    pub session_id: String,
    /// Largest page the relay will serve or accept
    pub max_batch_size: usize,
    /// Undelivered backlog for this replica
    pub queue_depth: u64,
}

/// Pull query: everything after `cursor`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// `last_received_op_id`, `None` for an initial sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Envelopes from other replicas, in relay arrival order
    pub envelopes: Vec<SyncEnvelope>,
    /// Cursor to send on the next pull. Advances past the requester's own
    /// envelopes even though they are not returned
    pub cursor: Option<OperationId>,
    pub has_more: bool,
    /// Undelivered backlog for this replica after this page
    pub queue_depth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub envelopes: Vec<SyncEnvelope>,
}

/// An envelope the relay refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEnvelope {
    pub op_id: OperationId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Stored or already known
    pub acknowledged: Vec<OperationId>,
    pub rejected: Vec<RejectedEnvelope>,
    /// Total undelivered backlog at the relay
    pub queue_depth: u64,
}

/// Messages sent from a replica over the websocket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pull {
        #[serde(default)]
        cursor: Option<OperationId>,
        #[serde(default)]
        limit: Option<usize>,
        /// Correlates the response
        #[serde(default)]
        request_id: Option<String>,
    },
    Push {
        envelopes: Vec<SyncEnvelope>,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Keep-alive ping.
    Ping,
}

/// Messages sent from the relay over the websocket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        relay_id: String,
        protocol_version: u32,
    },
    PullResponse {
        envelopes: Vec<SyncEnvelope>,
        cursor: Option<OperationId>,
        has_more: bool,
        queue_depth: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    PushResponse {
        acknowledged: Vec<OperationId>,
        rejected: Vec<RejectedEnvelope>,
        queue_depth: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Another replica pushed; pull to fetch.
    EnvelopesAvailable {
        origin_replica: ReplicaId,
        count: usize,
    },
    Pong,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn pull_response(response: PullResponse, request_id: Option<String>) -> Self {
        ServerMessage::PullResponse {
            envelopes: response.envelopes,
            cursor: response.cursor,
            has_more: response.has_more,
            queue_depth: response.queue_depth,
            request_id,
        }
    }

    pub fn push_response(response: PushResponse, request_id: Option<String>) -> Self {
        ServerMessage::PushResponse {
            acknowledged: response.acknowledged,
            rejected: response.rejected,
            queue_depth: response.queue_depth,
            request_id,
        }
    }
}
