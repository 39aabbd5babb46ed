//! Transactional Outbox Repository Implementation
//!
//! Command-side writes: the caller's business statements and the outbox row
//! share one PostgreSQL transaction.

use super::postgres::{PostgresOutboxRepository, insert_event};
use async_trait::async_trait;
use cube_castle_sync_domain::outbox::{NewOutboxEvent, OutboxError, OutboxRepositoryTx};
use sqlx::postgres::PgTransaction;
use tracing::debug;

#[async_trait]
impl OutboxRepositoryTx for PostgresOutboxRepository {
    async fn save_event_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        event: &NewOutboxEvent,
    ) -> Result<(), OutboxError> {
        insert_event(tx, event).await?;
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Outbox event staged in caller transaction"
        );
        Ok(())
    }
}
