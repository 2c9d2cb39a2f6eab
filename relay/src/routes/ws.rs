//! WebSocket upgrade route.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::auth::AuthReplica;
use crate::handlers::handle_websocket_connection;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade_handler))
}

/// GET /ws - Authenticate, then hand the socket to the connection loop.
async fn upgrade_handler(
    State(state): State<AppState>,
    auth: AuthReplica,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, auth.replica_id))
}
