//! State shared by the graph sync consumers
//!
//! Lifecycle flag, counters and the helpers that turn an event envelope
//! into node keys, stamps and audit records.

use cube_castle_sync_domain::consumer::{ConsumeOutcome, ConsumerError, ConsumerStats};
use cube_castle_sync_domain::events::DomainEvent;
use cube_castle_sync_domain::graph_sync::{
    AuditRecord, EventStamp, GraphMutation, NodeRef, Properties, PropertyValue,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Properties maintained by the graph backends, never taken from payloads
const RESERVED_PROPERTIES: [&str; 8] = [
    "id",
    "tenant_id",
    "is_deleted",
    "deleted_at",
    "deleted_by_event_id",
    "last_event_at",
    "last_event_id",
    "synced_at",
];

pub(crate) struct ConsumerState {
    name: String,
    pattern: &'static str,
    running: AtomicBool,
    processed: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ConsumerState {
    pub(crate) fn new(name: impl Into<String>, pattern: &'static str) -> Self {
        Self {
            name: name.into(),
            pattern,
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pattern(&self) -> &'static str {
        self.pattern
    }

    /// Idempotent: starting a running consumer is not an error.
    pub(crate) fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            info!(consumer = %self.name, pattern = self.pattern, "▶️ Consumer started");
        }
    }

    pub(crate) fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!(consumer = %self.name, "⏹️ Consumer stopped");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), ConsumerError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ConsumerError::Stopped(self.name.clone()))
        }
    }

    pub(crate) fn record(&self, result: &Result<ConsumeOutcome, ConsumerError>) {
        match result {
            Ok(ConsumeOutcome::Applied) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ConsumeOutcome::Ignored) => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }

    pub(crate) fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            name: self.name.clone(),
            pattern: self.pattern.to_string(),
            running: self.is_running(),
            processed: self.processed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

pub(crate) fn stamp_of(event: &DomainEvent) -> EventStamp {
    EventStamp::new(event.event_id, event.occurred_at)
}

/// `id` and `tenant_id` of the event's aggregate; the tenant is mandatory.
pub(crate) fn entity_keys(event: &DomainEvent) -> Result<Properties, ConsumerError> {
    let tenant_id = event
        .tenant_id
        .ok_or_else(|| ConsumerError::invalid_event(event, "missing tenant_id"))?;
    if event.aggregate_id.is_empty() {
        return Err(ConsumerError::invalid_event(event, "empty aggregate_id"));
    }
    Ok(Properties::from([
        ("id".to_string(), event.aggregate_id.clone().into()),
        ("tenant_id".to_string(), tenant_id.into()),
    ]))
}

pub(crate) fn node_ref(label: &str, keys: &Properties) -> NodeRef {
    NodeRef::new(label, keys.clone())
}

/// Payload fields of a partial update, bookkeeping names removed
pub(crate) fn updated_properties(
    fields: &std::collections::BTreeMap<String, serde_json::Value>,
) -> Properties {
    fields
        .iter()
        .filter(|(k, _)| !RESERVED_PROPERTIES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
        .collect()
}

pub(crate) fn audit(label: &str, event: &DomainEvent) -> Result<GraphMutation, ConsumerError> {
    let payload = event
        .payload
        .to_data()
        .map_err(|e| ConsumerError::invalid_event(event, e.to_string()))?;

    let mut properties = Properties::new();
    properties.insert("event_type".into(), event.event_type.clone().into());
    properties.insert("aggregate_id".into(), event.aggregate_id.clone().into());
    properties.insert("tenant_id".into(), event.tenant_id.into());
    properties.insert("occurred_at".into(), event.occurred_at.into());
    properties.insert("version".into(), event.version.into());
    properties.insert("correlation_id".into(), event.correlation_id.into());
    properties.insert("payload".into(), payload.to_string().into());

    Ok(GraphMutation::Audit(AuditRecord {
        label: label.to_string(),
        event_id: event.event_id,
        properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_castle_sync_domain::events::EventPayload;
    use serde_json::json;
    use uuid::Uuid;

    fn event() -> DomainEvent {
        DomainEvent::new(
            "employee.updated",
            "employee",
            "emp-1",
            EventPayload::Opaque(json!({})),
        )
    }

    #[test]
    fn test_keys_require_tenant() {
        assert!(matches!(
            entity_keys(&event()),
            Err(ConsumerError::InvalidEvent { .. })
        ));

        let tenant = Uuid::new_v4();
        let keys = entity_keys(&event().with_tenant(tenant)).unwrap();
        assert_eq!(keys["id"].as_str(), Some("emp-1"));
        assert_eq!(keys["tenant_id"], PropertyValue::from(tenant));
    }

    #[test]
    fn test_reserved_fields_are_dropped() {
        let fields = [
            ("email".to_string(), json!("a@b.c")),
            ("is_deleted".to_string(), json!(true)),
            ("id".to_string(), json!("other")),
        ]
        .into_iter()
        .collect();
        let props = updated_properties(&fields);
        assert_eq!(props.len(), 1);
        assert!(props.contains_key("email"));
    }

    #[test]
    fn test_stats_follow_results() {
        let state = ConsumerState::new("employee", "employee.*");
        assert!(state.ensure_running().is_err());
        state.start();
        state.record(&Ok(ConsumeOutcome::Applied));
        state.record(&Ok(ConsumeOutcome::Ignored));
        state.record(&Err(ConsumerError::Stopped("x".into())));

        let stats = state.stats();
        assert!(stats.running);
        assert_eq!((stats.processed, stats.ignored, stats.failed), (1, 1, 1));
        assert_eq!(stats.last_error.as_deref(), Some("consumer 'x' is not running"));
    }
}
