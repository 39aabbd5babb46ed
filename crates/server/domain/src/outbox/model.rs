//! Outbox Event Model
//!
//! Domain model for rows of the `outbox` table used by the Transactional
//! Outbox Pattern.

use chrono::{DateTime, Utc};
use cube_castle_shared::aggregate_types;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error types for outbox operations
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event not found: {0}")]
    NotFound(Uuid),

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

/// A persisted outbox row
///
/// `payload` is opaque to the dispatcher; it is handed to the event decoder
/// table which produces the typed bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic row id, used for FIFO ordering within a batch
    pub id: i64,
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    /// Earliest instant at which the row may be dispatched again
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// True when a dispatcher may pick this row at `now`.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        !self.published && self.available_at <= now
    }

    /// Time elapsed since the row was written.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// An outbox event ready to be inserted in the caller's transaction
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Create an employee-related event
    pub fn for_employee(
        employee_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            employee_id.to_string(),
            aggregate_types::EMPLOYEE,
            event_type,
            payload,
        )
    }

    /// Create an organization-related event
    pub fn for_organization(
        organization_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            organization_id.to_string(),
            aggregate_types::ORGANIZATION,
            event_type,
            payload,
        )
    }

    /// Keep a caller-provided event id instead of the generated one.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(published: bool, available_in_secs: i64) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: 1,
            event_id: Uuid::new_v4(),
            aggregate_id: "agg-1".to_string(),
            aggregate_type: "employee".to_string(),
            event_type: "employee.created".to_string(),
            payload: json!({}),
            retry_count: 0,
            published,
            published_at: None,
            available_at: now + chrono::Duration::seconds(available_in_secs),
            created_at: now,
        }
    }

    #[test]
    fn test_dispatchable_requires_unpublished_and_due() {
        let now = Utc::now() + chrono::Duration::milliseconds(10);
        assert!(row(false, 0).is_dispatchable(now));
        assert!(!row(true, 0).is_dispatchable(now));
        assert!(!row(false, 60).is_dispatchable(now));
    }

    #[test]
    fn test_for_employee_sets_aggregate() {
        let id = Uuid::new_v4();
        let event = NewOutboxEvent::for_employee(id, "employee.hired", json!({"a": 1}));
        assert_eq!(event.aggregate_id, id.to_string());
        assert_eq!(event.aggregate_type, "employee");
        assert_eq!(event.event_type, "employee.hired");
    }

    #[test]
    fn test_with_event_id_overrides_generated_id() {
        let fixed = Uuid::new_v4();
        let event = NewOutboxEvent::for_organization(Uuid::new_v4(), "organization.created", json!({}))
            .with_event_id(fixed);
        assert_eq!(event.event_id, fixed);
        assert_eq!(event.aggregate_type, "organization");
    }
}
