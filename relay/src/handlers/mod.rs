//! Request handlers for the sync protocol.
//!
//! HTTP routes and the websocket channel both dispatch here.

mod handshake;
mod pull;
mod push;
mod websocket;

pub use handshake::*;
pub use pull::*;
pub use push::*;
pub use websocket::*;
