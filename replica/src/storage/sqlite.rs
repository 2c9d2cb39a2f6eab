//! SQLite document store.
//!
//! One `documents` table keyed by `(namespace, key)`. WAL mode keeps readers
//! (the UI querying entities) from blocking the single writer.

use super::DocumentStore;
use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Persistent document store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening replica store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}?mode=rwc"))
            .map_err(|e| ReplicaError::Config(format!("Invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    /// A private in-memory database. Lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicaError::Config(e.to_string()))?;
        // Every connection would get its own empty database otherwise
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (namespace, key, value) VALUES (?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| ReplicaError::persistence(&format!("put {namespace}/{key}"), e))?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM documents WHERE namespace = ? AND key = ?")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ReplicaError::persistence(&format!("delete {namespace}/{key}"), e))?;
        Ok(())
    }

    async fn scan_after(
        &self,
        namespace: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT key, value FROM documents
            WHERE namespace = ? AND key > ?
            ORDER BY key ASC
            LIMIT ?
            "#,
        )
        .bind(namespace)
        .bind(after.unwrap_or(""))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM documents WHERE namespace = ?")
                .bind(namespace)
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put("ns", "k", b"one".to_vec()).await.unwrap();
        store.put("ns", "k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), Some(b"two".to_vec()));

        store.delete("ns", "k").await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_after_orders_keys() {
        let store = SqliteStore::in_memory().await.unwrap();
        for key in ["03", "01", "02"] {
            store.put("log", key, vec![]).await.unwrap();
        }
        store.put("other", "00", vec![]).await.unwrap();

        let keys: Vec<String> = store
            .scan("log")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["01", "02", "03"]);

        let after = store.scan_after("log", Some("01"), 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, "02");
        assert_eq!(store.count("log").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put("meta", "clock", b"{}".to_vec()).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.get("meta", "clock").await.unwrap(), Some(b"{}".to_vec()));
    }
}
