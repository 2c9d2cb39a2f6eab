//! PostgreSQL envelope store.

use super::{AppendOutcome, EnvelopePage, EnvelopeStore, StoreStats};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use concord_engine::{OperationId, SyncEnvelope, VectorClock};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use ulid::Ulid;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Serializes appends so arrival sequence matches commit order. Readers
/// then never see a gap that a slower writer fills in later.
const APPEND_LOCK_KEY: i64 = 0x636f_6e63_6f72_64;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> std::result::Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// A stored envelope row.
#[derive(Debug)]
struct StoredEnvelope {
    op_id: String,
    entity_id: String,
    origin_replica: String,
    clock: Json<VectorClock>,
    encrypted_payload: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StoredEnvelope {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredEnvelope {
            op_id: row.try_get("op_id")?,
            entity_id: row.try_get("entity_id")?,
            origin_replica: row.try_get("origin_replica")?,
            clock: row.try_get("clock")?,
            encrypted_payload: row.try_get("encrypted_payload")?,
        })
    }
}

impl StoredEnvelope {
    fn into_envelope(self) -> Result<SyncEnvelope> {
        Ok(SyncEnvelope {
            op_id: parse_op_id(&self.op_id)?,
            entity_id: self.entity_id,
            origin_replica: self.origin_replica,
            clock: self.clock.0,
            encrypted_payload: self.encrypted_payload,
        })
    }
}

fn parse_op_id(raw: &str) -> Result<OperationId> {
    Ulid::from_string(raw).map_err(|e| AppError::Internal(format!("stored op id {raw}: {e}")))
}

/// Envelope log in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgEnvelopeStore {
    pool: Pool,
}

impl PgEnvelopeStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn resolve(&self, cursor: Option<&OperationId>) -> Result<i64> {
        let Some(cursor) = cursor else {
            return Ok(0);
        };
        let seq: Option<i64> = sqlx::query_scalar("SELECT seq FROM envelopes WHERE op_id = $1")
            .bind(cursor.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(seq.unwrap_or(0))
    }
}

#[async_trait]
impl EnvelopeStore for PgEnvelopeStore {
    async fn append(&self, envelopes: &[SyncEnvelope]) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut outcome = AppendOutcome::default();
        for envelope in envelopes {
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO envelopes (op_id, entity_id, origin_replica, clock, encrypted_payload)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (op_id) DO NOTHING
                RETURNING seq
                "#,
            )
            .bind(envelope.op_id.to_string())
            .bind(&envelope.entity_id)
            .bind(&envelope.origin_replica)
            .bind(Json(&envelope.clock))
            .bind(&envelope.encrypted_payload)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(_) => outcome.stored.push(envelope.op_id),
                None => outcome.duplicates.push(envelope.op_id),
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn fetch_after(
        &self,
        cursor: Option<&OperationId>,
        requester: &str,
        limit: usize,
    ) -> Result<EnvelopePage> {
        let after = self.resolve(cursor).await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX - 1);

        let mut rows: Vec<StoredEnvelope> = sqlx::query_as(
            r#"
            SELECT op_id, entity_id, origin_replica, clock, encrypted_payload
            FROM envelopes
            WHERE seq > $1
            ORDER BY seq ASC
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);

        let cursor = match rows.last() {
            Some(last) => Some(parse_op_id(&last.op_id)?),
            None if after > 0 => cursor.copied(),
            None => None,
        };

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            if row.origin_replica != requester {
                envelopes.push(row.into_envelope()?);
            }
        }

        Ok(EnvelopePage {
            envelopes,
            cursor,
            has_more,
        })
    }

    async fn register_replica(&self, replica_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replica_cursors (replica_id, delivered_seq)
            VALUES ($1, 0)
            ON CONFLICT (replica_id) DO UPDATE SET last_seen_at = NOW()
            "#,
        )
        .bind(replica_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery(&self, replica_id: &str, cursor: Option<&OperationId>) -> Result<()> {
        let seq = self.resolve(cursor).await?;
        sqlx::query(
            r#"
            INSERT INTO replica_cursors (replica_id, delivered_seq)
            VALUES ($1, $2)
            ON CONFLICT (replica_id)
            DO UPDATE SET delivered_seq = EXCLUDED.delivered_seq, last_seen_at = NOW()
            "#,
        )
        .bind(replica_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_depth_for(&self, replica_id: &str) -> Result<u64> {
        let depth: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM envelopes
            WHERE origin_replica <> $1
              AND seq > COALESCE(
                  (SELECT delivered_seq FROM replica_cursors WHERE replica_id = $1), 0)
            "#,
        )
        .bind(replica_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(depth.max(0) as u64)
    }

    async fn queue_depth(&self, active_within: Duration) -> Result<u64> {
        let depth: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(backlog), 0)::BIGINT
            FROM (
                SELECT (
                    SELECT COUNT(*)
                    FROM envelopes e
                    WHERE e.seq > r.delivered_seq AND e.origin_replica <> r.replica_id
                ) AS backlog
                FROM replica_cursors r
                WHERE r.last_seen_at > NOW() - make_interval(secs => $1)
            ) per_replica
            "#,
        )
        .bind(active_within.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(depth.max(0) as u64)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM envelopes) AS envelopes,
                (SELECT COUNT(*) FROM replica_cursors) AS replicas
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let envelopes: i64 = row.try_get("envelopes")?;
        let replicas: i64 = row.try_get("replicas")?;
        Ok(StoreStats {
            envelopes: envelopes.max(0) as u64,
            replicas: replicas.max(0) as u64,
        })
    }
}
