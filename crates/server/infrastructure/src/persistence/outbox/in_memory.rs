//! In-memory outbox repository
//!
//! Transactions hold the whole table for their lifetime and work on a
//! staged copy, so concurrent dispatchers never see the same row and an
//! uncommitted batch leaves no trace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cube_castle_sync_domain::outbox::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxRepository, OutboxStats, OutboxTransaction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct OutboxTable {
    next_id: i64,
    rows: Vec<OutboxEvent>,
}

impl OutboxTable {
    fn insert(&mut self, event: &NewOutboxEvent) -> Result<(), OutboxError> {
        if self.rows.iter().any(|r| r.event_id == event.event_id) {
            return Err(OutboxError::InfrastructureError {
                message: format!("duplicate event_id {}", event.event_id),
            });
        }
        self.next_id += 1;
        let now = Utc::now();
        self.rows.push(OutboxEvent {
            id: self.next_id,
            event_id: event.event_id,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            retry_count: 0,
            published: false,
            published_at: None,
            available_at: now,
            created_at: now,
        });
        Ok(())
    }

    fn row_mut(&mut self, event_id: Uuid) -> Result<&mut OutboxEvent, OutboxError> {
        self.rows
            .iter_mut()
            .find(|r| r.event_id == event_id && !r.published)
            .ok_or(OutboxError::NotFound(event_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxRepository {
    table: Arc<Mutex<OutboxTable>>,
    failing_fetches: Arc<AtomicU32>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row outside any dispatcher transaction.
    pub async fn insert(&self, event: NewOutboxEvent) -> Result<(), OutboxError> {
        self.table.lock().await.insert(&event)
    }

    pub async fn get(&self, event_id: Uuid) -> Option<OutboxEvent> {
        self.table
            .lock()
            .await
            .rows
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned()
    }

    pub async fn rows(&self) -> Vec<OutboxEvent> {
        self.table.lock().await.rows.clone()
    }

    /// Make a row in backoff immediately dispatchable again.
    pub async fn make_available_now(&self, event_id: Uuid) {
        let mut table = self.table.lock().await;
        if let Some(row) = table.rows.iter_mut().find(|r| r.event_id == event_id) {
            row.available_at = Utc::now();
        }
    }

    /// The next `count` batch fetches fail with an infrastructure error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    fn take_fetch_failure(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        let guard = self.table.clone().lock_owned().await;
        let staged = guard.rows.clone();
        let next_id = guard.next_id;
        Ok(Box::new(InMemoryOutboxTransaction {
            guard,
            staged: OutboxTable {
                next_id,
                rows: staged,
            },
            fail_fetch: self.take_fetch_failure(),
        }))
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let table = self.table.lock().await;
        let now = Utc::now();
        let pending = table.rows.iter().filter(|r| !r.published);
        let mut stats = OutboxStats::default();
        for row in pending {
            stats.pending_count += 1;
            if row.retry_count > 0 {
                stats.retrying_count += 1;
            }
            let age = row.age(now).num_seconds();
            stats.oldest_pending_age_seconds =
                Some(stats.oldest_pending_age_seconds.map_or(age, |a| a.max(age)));
        }
        stats.published_count = table.rows.iter().filter(|r| r.published).count() as u64;
        Ok(stats)
    }
}

pub struct InMemoryOutboxTransaction {
    guard: OwnedMutexGuard<OutboxTable>,
    staged: OutboxTable,
    fail_fetch: bool,
}

#[async_trait]
impl OutboxTransaction for InMemoryOutboxTransaction {
    async fn save_event(&mut self, event: &NewOutboxEvent) -> Result<(), OutboxError> {
        self.staged.insert(event)
    }

    async fn fetch_unpublished_for_update(
        &mut self,
        limit: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        if self.fail_fetch {
            return Err(OutboxError::InfrastructureError {
                message: "connection reset while fetching outbox batch".to_string(),
            });
        }
        let now = Utc::now();
        let mut due: Vec<OutboxEvent> = self
            .staged
            .rows
            .iter()
            .filter(|r| r.is_dispatchable(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.created_at, r.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_published(&mut self, event_id: Uuid) -> Result<(), OutboxError> {
        let row = self.staged.row_mut(event_id)?;
        row.published = true;
        row.published_at = Some(Utc::now());
        Ok(())
    }

    async fn increment_retry(
        &mut self,
        event_id: Uuid,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let row = self.staged.row_mut(event_id)?;
        row.retry_count += 1;
        row.available_at = row.available_at.max(next_available_at);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        let InMemoryOutboxTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let repo = InMemoryOutboxRepository::new();
        let event = NewOutboxEvent::for_employee(Uuid::new_v4(), "employee.created", json!({}));
        let event_id = event.event_id;
        repo.insert(event).await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        let rows = tx.fetch_unpublished_for_update(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        tx.mark_published(event_id).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(!repo.get(event_id).await.unwrap().published);
    }

    #[tokio::test]
    async fn test_increment_retry_never_moves_available_at_back() {
        let repo = InMemoryOutboxRepository::new();
        let event = NewOutboxEvent::for_employee(Uuid::new_v4(), "employee.updated", json!({}));
        let event_id = event.event_id;
        repo.insert(event).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(30);

        let mut tx = repo.begin().await.unwrap();
        tx.increment_retry(event_id, later).await.unwrap();
        tx.increment_retry(event_id, later - chrono::Duration::seconds(20))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let row = repo.get(event_id).await.unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.available_at, later);
    }

    #[tokio::test]
    async fn test_fetch_respects_limit_and_order() {
        let repo = InMemoryOutboxRepository::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let event =
                NewOutboxEvent::for_organization(Uuid::new_v4(), "organization.created", json!({}));
            ids.push(event.event_id);
            repo.insert(event).await.unwrap();
        }

        let mut tx = repo.begin().await.unwrap();
        let rows = tx.fetch_unpublished_for_update(2).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.event_id).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
        tx.commit().await.unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.published_count, 0);
    }
}
