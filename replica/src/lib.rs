//! # Concord Replica
//!
//! The device side of Concord: local persistence, the change log of local
//! mutations, the conflict ledger, and the client of the sync relay
//! protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use concord_engine::{EntityTypeDef, FieldDef, StrategyRegistry};
//! use concord_replica::{
//!     AesGcmCipher, HttpTransport, Replica, ReplicaConfig, SqliteStore, SyncDriver, SyncSession,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(key: [u8; 32]) -> concord_replica::Result<()> {
//! let config = ReplicaConfig::new("laptop-1").with_relay("https://relay.example", None);
//! let registry = StrategyRegistry::new().with_type(
//!     EntityTypeDef::new("transaction")
//!         .with_field(FieldDef::value("amount"))
//!         .with_field(FieldDef::text("memo")),
//! );
//!
//! let store = Arc::new(SqliteStore::open("replica.db").await?);
//! let replica = Arc::new(
//!     Replica::open(config, store, registry, Arc::new(AesGcmCipher::new(&key))).await?,
//! );
//! replica.mutate("txn-1", "transaction", "amount", json!(100)).await?;
//!
//! let transport = Arc::new(HttpTransport::new(
//!     "https://relay.example",
//!     "laptop-1",
//!     None,
//!     Duration::from_secs(10),
//! )?);
//! let session = SyncSession::open(replica.clone(), transport, "relay.example").await?;
//! let driver = SyncDriver::spawn(session);
//!
//! let mut conflicts = replica.subscribe_conflicts();
//! while let Ok(event) = conflicts.recv().await {
//!     println!("{:?}", event.record().conflict_id);
//! }
//! driver.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod change_log;
pub mod cipher;
pub mod config;
pub mod error;
pub mod health;
pub mod ledger;
pub mod replica;
pub mod storage;
pub mod sync;
pub mod transport;

pub use change_log::ChangeLog;
pub use cipher::{AesGcmCipher, PayloadCipher};
pub use config::{ReplicaConfig, SyncTuning};
pub use error::{ReplicaError, Result};
pub use health::{HealthRegistry, HealthSnapshot, PeerHealth};
pub use ledger::{ConflictEvent, ConflictLedger, QuarantinedOperation};
pub use replica::{ApplyReport, Replica};
pub use storage::{DocumentStore, MemoryStore, SqliteStore};
pub use sync::{ConnectionState, RoundReport, SyncCursor, SyncDriver, SyncSession};
pub use transport::{HttpTransport, RelayTransport};

use concord_engine::Timestamp;

/// Wall-clock milliseconds. Only used for informational timestamps and the
/// retention window, never for ordering writes.
pub(crate) fn now_ms() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
