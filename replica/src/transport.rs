//! Relay transport.

use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use concord_engine::{
    HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    ReplicaId, REPLICA_ID_HEADER,
};
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Request/response exchange with a relay.
///
/// Implementations carry the replica's identity and credentials; callers
/// only see protocol messages.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse>;

    async fn push(&self, request: PushRequest) -> Result<PushResponse>;
}

/// Relay error body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(default)]
    queue_depth: Option<u64>,
}

/// JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    replica_id: ReplicaId,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        replica_id: impl Into<ReplicaId>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(ReplicaError::transport)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            replica_id: replica_id.into(),
            auth_token,
        })
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(REPLICA_ID_HEADER, &self.replica_id);
        match &self.auth_token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Map a relay response to its body or a typed error.
async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body: Option<ErrorBody> = response.json().await.ok();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(ReplicaError::Backpressure {
            queue_depth: body.as_ref().and_then(|b| b.queue_depth).unwrap_or(0),
        });
    }

    let message = body.map(|b| b.error).unwrap_or_else(|| status.to_string());
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        return Err(ReplicaError::Protocol(format!("{status}: {message}")));
    }
    Err(ReplicaError::Transport {
        message,
        status: Some(status.as_u16()),
    })
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        debug!(url = %self.base_url, "Handshaking with relay");
        let response = self
            .authorize(self.client.post(self.url("/handshake")))
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        let response = self
            .authorize(self.client.get(self.url("/sync")))
            .query(&request)
            .send()
            .await?;
        decode(response).await
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let response = self
            .authorize(self.client.post(self.url("/sync")))
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }
}
