//! Outbox Repository Traits
//!
//! Abstraction over the relational outbox table. Every operation the
//! dispatcher performs on a batch runs inside one [`OutboxTransaction`]:
//! the rows are locked by `fetch_unpublished_for_update` and the state
//! changes made by `mark_published` / `increment_retry` become visible only
//! on `commit`.

use crate::outbox::{NewOutboxEvent, OutboxError, OutboxEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgTransaction;
use uuid::Uuid;

/// Entry point of the outbox store
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Open a transaction on the relational store.
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError>;

    /// Counts by state, for monitoring.
    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

/// Transaction-scoped outbox operations
///
/// Dropping the handle without calling `commit` rolls the transaction back.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Persist a new outbox row in this transaction.
    ///
    /// The row starts unpublished, with `retry_count = 0` and
    /// `available_at = now`.
    async fn save_event(&mut self, event: &NewOutboxEvent) -> Result<(), OutboxError>;

    /// Lock and return up to `limit` unpublished rows whose `available_at`
    /// is due, in ascending `id` order.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED`: rows locked by another transaction are
    /// skipped, never waited on.
    async fn fetch_unpublished_for_update(
        &mut self,
        limit: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Set `published = true` and `published_at = now`.
    async fn mark_published(&mut self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Increment `retry_count` and push `available_at` forward to
    /// `next_available_at`. `available_at` never moves backwards.
    async fn increment_retry(
        &mut self,
        event_id: Uuid,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn commit(self: Box<Self>) -> Result<(), OutboxError>;

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError>;
}

/// Outbox writes inside a caller-owned PostgreSQL transaction
///
/// This is the command-side half of the pattern: the aggregate change and
/// its outbox row commit or roll back together.
#[async_trait]
pub trait OutboxRepositoryTx: Send + Sync {
    async fn save_event_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        event: &NewOutboxEvent,
    ) -> Result<(), OutboxError>;
}

/// Statistics about outbox rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending_count: u64,
    pub published_count: u64,
    /// Unpublished rows that have failed at least once
    pub retrying_count: u64,
    pub oldest_pending_age_seconds: Option<i64>,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending_count + self.published_count
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    /// Share of pending rows that are in backoff, as a percentage
    pub fn retry_rate(&self) -> f64 {
        if self.pending_count == 0 {
            0.0
        } else {
            (self.retrying_count as f64 / self.pending_count as f64) * 100.0
        }
    }
}
