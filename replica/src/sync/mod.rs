//! Sync relay protocol client.

mod backoff;
mod driver;
mod session;
mod state;

pub use backoff::Backoff;
pub use driver::SyncDriver;
pub use session::{RoundReport, SyncCursor, SyncSession};
pub use state::ConnectionState;
