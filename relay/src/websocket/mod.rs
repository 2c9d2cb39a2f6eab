//! WebSocket support for real-time sync.
//!
//! Replicas that keep a socket open are told when other replicas push, so
//! they can pull without waiting for their poll interval.

mod manager;

pub use manager::ConnectionManager;
