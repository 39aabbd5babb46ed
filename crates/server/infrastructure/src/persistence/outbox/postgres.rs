//! PostgreSQL Outbox Repository
//!
//! SQLx-based implementation of [`OutboxRepository`] for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cube_castle_sync_domain::outbox::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxRepository, OutboxStats, OutboxTransaction,
};
use sqlx::postgres::{PgArguments, PgPool, PgTransaction, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, FromRow};
use tracing::{debug, warn};
use uuid::Uuid;

/// Row struct for outbox queries
#[derive(FromRow)]
pub(crate) struct OutboxEventRow {
    id: i64,
    event_id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    payload: sqlx::types::Json<serde_json::Value>,
    retry_count: i32,
    published: bool,
    published_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<OutboxEventRow> for OutboxEvent {
    fn from(row: OutboxEventRow) -> Self {
        OutboxEvent {
            id: row.id,
            event_id: row.event_id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload.0,
            retry_count: row.retry_count,
            published: row.published,
            published_at: row.published_at,
            available_at: row.available_at,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL implementation of OutboxRepository
#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its dispatch indexes
    pub async fn run_migrations(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                event_id UUID NOT NULL UNIQUE,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                published BOOLEAN NOT NULL DEFAULT FALSE,
                published_at TIMESTAMPTZ,
                available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_published_created
            ON outbox(published, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_published_available_created
            ON outbox(published, available_at, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Insert one row inside an open transaction
pub(crate) async fn insert_event(
    tx: &mut PgTransaction<'_>,
    event: &NewOutboxEvent,
) -> Result<(), OutboxError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (event_id, aggregate_id, aggregate_type, event_type, payload, available_at, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
        "#,
    )
    .bind(event.event_id)
    .bind(&event.aggregate_id)
    .bind(&event.aggregate_type)
    .bind(&event.event_type)
    .bind(sqlx::types::Json(&event.payload))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresOutboxTransaction { tx }))
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        #[derive(sqlx::FromRow)]
        struct StatsRow {
            pending_count: Option<i64>,
            published_count: Option<i64>,
            retrying_count: Option<i64>,
            oldest_pending_age_seconds: Option<i64>,
        }
        let result: StatsRow = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(CASE WHEN NOT published THEN 1 END) as pending_count,
                COUNT(CASE WHEN published THEN 1 END) as published_count,
                COUNT(CASE WHEN NOT published AND retry_count > 0 THEN 1 END) as retrying_count,
                CAST(MAX(CASE WHEN NOT published THEN EXTRACT(EPOCH FROM (NOW() - created_at)) END) AS BIGINT) as oldest_pending_age_seconds
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending_count: result.pending_count.unwrap_or(0) as u64,
            published_count: result.published_count.unwrap_or(0) as u64,
            retrying_count: result.retrying_count.unwrap_or(0) as u64,
            oldest_pending_age_seconds: result.oldest_pending_age_seconds,
        })
    }
}

/// A dispatcher batch transaction
///
/// Locks taken by `fetch_unpublished_for_update` are held until commit, so
/// the per-row updates must run on this same transaction. Each update runs
/// under its own savepoint: a failed statement is rolled back alone and the
/// rest of the batch can still commit.
pub struct PostgresOutboxTransaction {
    tx: PgTransaction<'static>,
}

impl PostgresOutboxTransaction {
    async fn update_row(
        &mut self,
        event_id: Uuid,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<(), OutboxError> {
        let mut savepoint = self.tx.begin().await?;
        let result = query.execute(&mut *savepoint).await;

        match result {
            Ok(done) if done.rows_affected() > 0 => {
                savepoint.commit().await?;
                Ok(())
            }
            Ok(_) => {
                savepoint.rollback().await?;
                Err(OutboxError::NotFound(event_id))
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Outbox row update rolled back to savepoint");
                savepoint.rollback().await?;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl OutboxTransaction for PostgresOutboxTransaction {
    async fn save_event(&mut self, event: &NewOutboxEvent) -> Result<(), OutboxError> {
        insert_event(&mut self.tx, event).await
    }

    async fn fetch_unpublished_for_update(
        &mut self,
        limit: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows: Vec<OutboxEventRow> = sqlx::query_as::<_, OutboxEventRow>(
            r#"
            SELECT id, event_id, aggregate_id, aggregate_type, event_type, payload,
                   retry_count, published, published_at, available_at, created_at
            FROM outbox
            WHERE published = FALSE
            AND available_at <= NOW()
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await?;

        debug!(count = rows.len(), "Fetched unpublished outbox rows");
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_published(&mut self, event_id: Uuid) -> Result<(), OutboxError> {
        let query = sqlx::query(
            r#"
            UPDATE outbox
            SET published = TRUE, published_at = NOW()
            WHERE event_id = $1 AND published = FALSE
            "#,
        )
        .bind(event_id);
        self.update_row(event_id, query).await
    }

    async fn increment_retry(
        &mut self,
        event_id: Uuid,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let query = sqlx::query(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                available_at = GREATEST(available_at, $2)
            WHERE event_id = $1 AND published = FALSE
            "#,
        )
        .bind(event_id)
        .bind(next_available_at);
        self.update_row(event_id, query).await
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
