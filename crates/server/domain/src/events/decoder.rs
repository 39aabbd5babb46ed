//! Event decoder table
//!
//! Maps an event type string to the function that turns an outbox payload
//! into a typed [`EventPayload`]. Event types without an entry decode to
//! [`EventPayload::Opaque`]; a payload that does not match the schema of a
//! registered type is a [`DecodeError`].
//!
//! Two payload shapes are accepted:
//! - envelope form: `{"metadata": {..}, "data": {..}}`, as written by
//!   [`outbox_event_from`]
//! - bare form: the body itself, with an optional top-level `tenant_id`

use super::envelope::{DomainEvent, EventMetadata};
use super::payload::*;
use crate::outbox::{NewOutboxEvent, OutboxEvent};
use cube_castle_shared::{employee_events, organization_events};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload of '{event_type}' does not match its schema: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid event metadata field '{field}': {reason}")]
    InvalidMetadata { field: &'static str, reason: String },
}

pub type DecodeFn = fn(&str, &Value) -> Result<EventPayload, DecodeError>;

fn body<T: DeserializeOwned>(event_type: &str, data: &Value) -> Result<T, DecodeError> {
    serde_json::from_value(data.clone()).map_err(|source| DecodeError::InvalidPayload {
        event_type: event_type.to_string(),
        source,
    })
}

/// Registry of event-type decoders
#[derive(Clone, Default)]
pub struct EventDecoderRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl EventDecoderRegistry {
    /// Empty table: every event decodes as opaque.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every HR employee and organization event.
    pub fn with_hr_events() -> Self {
        let mut registry = Self::new();
        registry.register(employee_events::CREATED, |t, d| {
            body(t, d).map(EventPayload::EmployeeCreated)
        });
        registry.register(employee_events::UPDATED, |t, d| {
            body(t, d).map(EventPayload::EmployeeUpdated)
        });
        registry.register(employee_events::DELETED, |t, d| {
            body(t, d).map(EventPayload::EmployeeDeleted)
        });
        registry.register(employee_events::HIRED, |t, d| {
            body(t, d).map(EventPayload::EmployeeHired)
        });
        registry.register(employee_events::TERMINATED, |t, d| {
            body(t, d).map(EventPayload::EmployeeTerminated)
        });
        registry.register(employee_events::PHONE_UPDATED, |t, d| {
            body(t, d).map(EventPayload::EmployeePhoneUpdated)
        });
        registry.register(organization_events::CREATED, |t, d| {
            body(t, d).map(EventPayload::OrganizationCreated)
        });
        registry.register(organization_events::UPDATED, |t, d| {
            body(t, d).map(EventPayload::OrganizationUpdated)
        });
        registry.register(organization_events::DELETED, |t, d| {
            body(t, d).map(EventPayload::OrganizationDeleted)
        });
        registry.register(organization_events::RESTRUCTURED, |t, d| {
            body(t, d).map(EventPayload::OrganizationRestructured)
        });
        registry.register(organization_events::ACTIVATED, |t, d| {
            body(t, d).map(EventPayload::OrganizationActivated)
        });
        registry.register(organization_events::DEACTIVATED, |t, d| {
            body(t, d).map(EventPayload::OrganizationDeactivated)
        });
        registry
    }

    /// Register or replace the decoder of `event_type`.
    pub fn register(&mut self, event_type: impl Into<String>, decoder: DecodeFn) {
        self.decoders.insert(event_type.into(), decoder);
    }

    pub fn is_known(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode an event body.
    pub fn decode_payload(&self, event_type: &str, data: &Value) -> Result<EventPayload, DecodeError> {
        match self.decoders.get(event_type) {
            Some(decode) => decode(event_type, data),
            None => Ok(EventPayload::Opaque(data.clone())),
        }
    }

    /// Build the bus event of an outbox row.
    ///
    /// Identity fields come from the row columns; `occurred_at` defaults to
    /// the row creation time and `version` to 1.
    pub fn decode_row(&self, row: &OutboxEvent) -> Result<DomainEvent, DecodeError> {
        let (metadata, data) = split_payload(&row.payload)?;
        let payload = self.decode_payload(&row.event_type, data)?;

        Ok(DomainEvent {
            event_id: row.event_id,
            event_type: row.event_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            aggregate_type: row.aggregate_type.clone(),
            tenant_id: metadata.tenant_id,
            causation_id: metadata.causation_id,
            correlation_id: metadata.correlation_id,
            occurred_at: metadata.occurred_at.unwrap_or(row.created_at),
            version: metadata.version.unwrap_or(1),
            payload,
        })
    }
}

impl std::fmt::Debug for EventDecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventDecoderRegistry")
            .field("event_types", &types)
            .finish()
    }
}

fn split_payload(payload: &Value) -> Result<(EventMetadata, &Value), DecodeError> {
    if let (Some(metadata), Some(data)) = (payload.get("metadata"), payload.get("data")) {
        let metadata: EventMetadata =
            serde_json::from_value(metadata.clone()).map_err(|e| DecodeError::InvalidMetadata {
                field: "metadata",
                reason: e.to_string(),
            })?;
        return Ok((metadata, data));
    }

    let tenant_id = match payload.get("tenant_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => {
            Some(Uuid::parse_str(raw).map_err(|e| DecodeError::InvalidMetadata {
                field: "tenant_id",
                reason: e.to_string(),
            })?)
        }
        Some(other) => {
            return Err(DecodeError::InvalidMetadata {
                field: "tenant_id",
                reason: format!("expected a UUID string, got {}", other),
            });
        }
    };

    Ok((
        EventMetadata {
            tenant_id,
            ..EventMetadata::default()
        },
        payload,
    ))
}

/// Serialize a bus event into the outbox row that carries it.
pub fn outbox_event_from(event: &DomainEvent) -> Result<NewOutboxEvent, serde_json::Error> {
    let payload = json!({
        "metadata": serde_json::to_value(event.metadata())?,
        "data": event.payload.to_data()?,
    });
    Ok(NewOutboxEvent::new(
        event.aggregate_id.clone(),
        event.aggregate_type.clone(),
        event.event_type.clone(),
        payload,
    )
    .with_event_id(event.event_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn row(event_type: &str, payload: Value) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: 7,
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4().to_string(),
            aggregate_type: "employee".to_string(),
            event_type: event_type.to_string(),
            payload,
            retry_count: 0,
            published: false,
            published_at: None,
            available_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_decode_bare_employee_created() {
        let tenant = Uuid::new_v4();
        let registry = EventDecoderRegistry::with_hr_events();
        let outbox_row = row(
            employee_events::CREATED,
            json!({
                "tenant_id": tenant.to_string(),
                "employee_number": "E-001",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": "ada@example.com",
                "hire_date": "2024-03-01"
            }),
        );

        let event = registry.decode_row(&outbox_row).unwrap();

        assert_eq!(event.event_id, outbox_row.event_id);
        assert_eq!(event.tenant_id, Some(tenant));
        assert_eq!(event.occurred_at, outbox_row.created_at);
        assert_eq!(event.version, 1);
        match event.payload {
            EventPayload::EmployeeCreated(p) => {
                assert_eq!(p.employee_number, "E-001");
                assert_eq!(p.hire_date, NaiveDate::from_ymd_opt(2024, 3, 1));
                assert_eq!(p.status, "ACTIVE");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_is_opaque() {
        let registry = EventDecoderRegistry::with_hr_events();
        let event = registry
            .decode_row(&row("position.created", json!({"title": "CTO"})))
            .unwrap();
        assert_eq!(event.payload, EventPayload::Opaque(json!({"title": "CTO"})));
        assert!(event.tenant_id.is_none());
    }

    #[test]
    fn test_schema_mismatch_is_decode_error() {
        let registry = EventDecoderRegistry::with_hr_events();
        let result = registry.decode_row(&row(employee_events::HIRED, json!({"hire_date": 42})));
        assert!(matches!(result, Err(DecodeError::InvalidPayload { .. })));
    }

    #[test]
    fn test_invalid_tenant_id_is_decode_error() {
        let registry = EventDecoderRegistry::new();
        let result = registry.decode_row(&row("employee.custom", json!({"tenant_id": "nope"})));
        assert!(matches!(
            result,
            Err(DecodeError::InvalidMetadata { field: "tenant_id", .. })
        ));
    }

    #[test]
    fn test_envelope_form_preserves_metadata() {
        let registry = EventDecoderRegistry::with_hr_events();
        let tenant = Uuid::new_v4();
        let correlation = Uuid::new_v4();
        let occurred_at = Utc::now() - chrono::Duration::minutes(3);
        let source = DomainEvent::new(
            employee_events::PHONE_UPDATED,
            "employee",
            Uuid::new_v4().to_string(),
            EventPayload::EmployeePhoneUpdated(EmployeePhoneUpdated {
                phone_number: "+34 600 000 000".to_string(),
            }),
        )
        .with_tenant(tenant)
        .with_correlation(correlation, None)
        .with_occurred_at(occurred_at);

        let new_row = outbox_event_from(&source).unwrap();
        let mut stored = row(employee_events::PHONE_UPDATED, new_row.payload);
        stored.event_id = new_row.event_id;
        stored.aggregate_id = new_row.aggregate_id;

        let decoded = registry.decode_row(&stored).unwrap();
        assert_eq!(decoded.event_id, source.event_id);
        assert_eq!(decoded.tenant_id, Some(tenant));
        assert_eq!(decoded.correlation_id, Some(correlation));
        assert_eq!(decoded.occurred_at, occurred_at);
        assert_eq!(decoded.payload, source.payload);
    }

    #[test]
    fn test_register_overrides_decoder() {
        let mut registry = EventDecoderRegistry::new();
        assert!(registry.is_empty());
        registry.register("employee.custom", |_, d| Ok(EventPayload::Opaque(json!({"wrapped": d}))));
        assert!(registry.is_known("employee.custom"));
        let payload = registry.decode_payload("employee.custom", &json!(1)).unwrap();
        assert_eq!(payload, EventPayload::Opaque(json!({"wrapped": 1})));
    }
}
