//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! `claim_batch` is a single statement: a CTE selects due rows with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` flips them to
//! `PROCESSING`. Rows locked by a concurrent claimer are skipped rather than
//! awaited, so dispatchers never overlap and a slow claimer never stalls the
//! others.
//!
//! Each claim writes a fresh `claim_token` onto its rows. Renewals and
//! acknowledgements filter on that token as well as on `PROCESSING`, and
//! reclaiming clears it.
//!
//! ## Time
//!
//! Every timestamp the dispatcher compares against (`next_retry_at`,
//! `updated_at`, the reclaim cutoff) is bound from the store's [`Clock`], the
//! same clock the dispatcher uses to compute `next_retry_at`. The database's
//! `NOW()` only fills `created_at` on insert, which affects ordering alone.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` |
//! | `Database` | `Database` |
//! | `ColumnDecode`, `Decode`, `ColumnNotFound` | `Corrupt` |
//! | Other | `Database` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use loyalty_core::{ClaimToken, Clock, EventId, SystemClock};

use super::{OutboxStats, OutboxStore, StoreError};
use crate::event::{ClaimedEvent, EventStatus, FailureRecord, NewOutboxEvent, OutboxEvent};

/// Idempotent DDL for the outbox table, one statement per entry.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id              UUID PRIMARY KEY,
        aggregate_type  TEXT NOT NULL,
        aggregate_id    TEXT NULL,
        event_type      TEXT NOT NULL,
        payload         JSONB NOT NULL,
        status          TEXT NOT NULL DEFAULT 'PENDING'
                        CHECK (status IN ('PENDING', 'PROCESSING', 'SENT', 'FAILED', 'DEAD')),
        attempt_count   INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        last_error      TEXT NULL,
        next_retry_at   TIMESTAMPTZ NULL,
        claim_token     UUID NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    ALTER TABLE outbox_events ADD COLUMN IF NOT EXISTS claim_token UUID NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_claimable_idx
        ON outbox_events (created_at, id)
        WHERE status IN ('PENDING', 'FAILED')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_processing_idx
        ON outbox_events (updated_at)
        WHERE status = 'PROCESSING'
    "#,
];

const SELECT_COLUMNS: &str = r#"
    id, aggregate_type, aggregate_id, event_type, payload, status,
    attempt_count, last_error, next_retry_at, claim_token, created_at, updated_at
"#;

/// Postgres-backed outbox store.
///
/// `Send + Sync`; all operations go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for claim eligibility, leases and acknowledgement times.
    /// Share it with the dispatcher so retry deadlines and the claim query
    /// read the same time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

/// Insert an event inside the caller's transaction.
///
/// The event becomes visible to dispatchers only if the surrounding business
/// transaction commits.
pub async fn enqueue_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<EventId, StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.id.as_uuid())
    .bind(&event.aggregate_type)
    .bind(event.aggregate_id.as_deref())
    .bind(&event.event_type)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("enqueue_in_tx", e))?;

    Ok(event.id)
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, event_type = %event.event_type),
        err
    )]
    async fn insert(&self, event: NewOutboxEvent) -> Result<EventId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id.as_deref())
        .bind(&event.event_type)
        .bind(&event.payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(event.id)
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let token = ClaimToken::new();
        let rows = sqlx::query(
            r#"
            WITH cte AS (
                SELECT id
                FROM outbox_events
                WHERE status IN ('PENDING', 'FAILED')
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET status = 'PROCESSING', claim_token = $3, updated_at = $2
            FROM cte
            WHERE o.id = cte.id
            RETURNING o.id, o.claim_token, o.event_type, o.payload, o.attempt_count, o.created_at
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(self.clock.now())
        .bind(token.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = rows
            .iter()
            .map(|row| -> Result<ClaimedEvent, StoreError> {
                ClaimedRow::from_row(row)
                    .map_err(|e| map_sqlx_error("claim_batch", e))?
                    .try_into()
            })
            .collect::<Result<Vec<_>, _>>()?;

        // RETURNING does not preserve the CTE's order.
        claimed.sort_by_key(|e| (e.created_at, e.id));

        debug!(count = claimed.len(), "claimed outbox batch");
        Ok(claimed)
    }

    #[instrument(skip(self, token), fields(event_id = %id), err)]
    async fn renew_claim(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET updated_at = $3
            WHERE id = $1 AND status = 'PROCESSING' AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_claim", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotClaimed(id));
        }
        Ok(())
    }

    #[instrument(skip(self, token), fields(event_id = %id), err)]
    async fn mark_sent(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT',
                attempt_count = attempt_count + 1,
                claim_token = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'PROCESSING' AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotClaimed(id));
        }
        Ok(())
    }

    #[instrument(
        skip(self, failure),
        fields(event_id = %failure.id, attempt = failure.attempt, dead = failure.dead),
        err
    )]
    async fn mark_failed(&self, failure: FailureRecord) -> Result<(), StoreError> {
        let attempt = i32::try_from(failure.attempt)
            .map_err(|_| StoreError::Database(format!("attempt out of range: {}", failure.attempt)))?;

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2,
                attempt_count = GREATEST(attempt_count, $3),
                last_error = $4,
                next_retry_at = $5,
                claim_token = NULL,
                updated_at = $7
            WHERE id = $1 AND status = 'PROCESSING' AND claim_token = $6
            "#,
        )
        .bind(failure.id.as_uuid())
        .bind(failure.status().as_str())
        .bind(attempt)
        .bind(&failure.error)
        .bind(failure.next_retry_at)
        .bind(failure.claim_token.as_uuid())
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotClaimed(failure.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            // Nothing can be older than that.
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', claim_token = NULL, updated_at = $2
            WHERE id IN (
                SELECT id
                FROM outbox_events
                WHERE status = 'PROCESSING'
                  AND updated_at < $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| -> Result<OutboxEvent, StoreError> {
            OutboxEventRow::from_row(&row)
                .map_err(|e| map_sqlx_error("get", e))?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events WHERE status = 'DEAD' ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead", e))?;

        rows.iter()
            .map(|row| -> Result<OutboxEvent, StoreError> {
                OutboxEventRow::from_row(row)
                    .map_err(|e| map_sqlx_error("list_dead", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM outbox_events
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status.parse::<EventStatus>().map_err(StoreError::Corrupt)?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        err @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn attempt_count_from_db(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative attempt_count: {value}")))
}

// SQLx row types

#[derive(Debug)]
struct ClaimedRow {
    id: uuid::Uuid,
    claim_token: uuid::Uuid,
    event_type: String,
    payload: serde_json::Value,
    attempt_count: i32,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ClaimedRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimedRow {
            id: row.try_get("id")?,
            claim_token: row.try_get("claim_token")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            attempt_count: row.try_get("attempt_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ClaimedRow> for ClaimedEvent {
    type Error = StoreError;

    fn try_from(row: ClaimedRow) -> Result<Self, Self::Error> {
        Ok(ClaimedEvent {
            id: EventId::from_uuid(row.id),
            claim_token: ClaimToken::from_uuid(row.claim_token),
            event_type: row.event_type,
            payload: row.payload,
            attempt_count: attempt_count_from_db(row.attempt_count)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct OutboxEventRow {
    id: uuid::Uuid,
    aggregate_type: String,
    aggregate_id: Option<String>,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    claim_token: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxEventRow {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            claim_token: row.try_get("claim_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: EventId::from_uuid(row.id),
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            attempt_count: attempt_count_from_db(row.attempt_count)?,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
