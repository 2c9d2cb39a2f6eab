//! # Concord Relay
//!
//! Store-and-forward relay for encrypted change envelopes. The relay never
//! sees plaintext: it orders envelopes by arrival, serves them to every
//! replica except their origin, and reports how much is still undelivered so
//! replicas can back off when it falls behind.
//!
//! ## Endpoints
//!
//! - `POST /handshake` opens a session and checks the protocol version
//! - `GET /sync` pulls envelopes after a cursor
//! - `POST /sync` pushes envelopes
//! - `GET /ws` carries pull and push over a websocket, with push notices
//! - `GET /health` reports backlog and connection counts

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::AppError;
pub use store::{EnvelopeStore, MemoryEnvelopeStore, PgEnvelopeStore};

use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EnvelopeStore>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn EnvelopeStore>) -> Self {
        Self {
            store,
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }

    /// State backed by a [`MemoryEnvelopeStore`].
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Arc::new(MemoryEnvelopeStore::new()))
    }
}

/// Build the router with tracing and CORS layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the relay on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, build_router(state)).await
}
