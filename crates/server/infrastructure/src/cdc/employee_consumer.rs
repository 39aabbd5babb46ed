//! Employee graph sync consumer
//!
//! ```text
//! employee.created        upsert (:Employee)
//! employee.updated        update supplied fields
//! employee.deleted        soft delete
//! employee.hired          status ACTIVE, hire date
//! employee.terminated     status TERMINATED, termination date and reason
//! employee.phone_updated  phone number
//! ```
//!
//! Every applied event also writes an `(:EmployeeEvent)` audit node.

use super::base::{ConsumerState, audit, entity_keys, stamp_of, updated_properties};
use async_trait::async_trait;
use cube_castle_shared::employee_events;
use cube_castle_sync_domain::consumer::{
    ConsumeOutcome, ConsumerError, ConsumerStats, EventConsumer,
};
use cube_castle_sync_domain::events::{DomainEvent, EventPayload};
use cube_castle_sync_domain::graph_sync::{
    ConnectionManager, ConnectionManagerExt, GraphMutation, MutationBatch, NodeSyncOperation,
    Properties, SyncOperationKind,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub const EMPLOYEE_LABEL: &str = "Employee";
pub const EMPLOYEE_AUDIT_LABEL: &str = "EmployeeEvent";
const KEYS: [&str; 2] = ["id", "tenant_id"];

pub struct EmployeeGraphConsumer {
    connection: Arc<dyn ConnectionManager>,
    state: ConsumerState,
}

impl EmployeeGraphConsumer {
    pub fn new(connection: Arc<dyn ConnectionManager>) -> Self {
        Self {
            connection,
            state: ConsumerState::new("employee-graph-sync", employee_events::PATTERN),
        }
    }

    /// Graph writes for one event; `None` when there is nothing to write.
    pub fn mutations_for(&self, event: &DomainEvent) -> Result<Option<MutationBatch>, ConsumerError> {
        let mut properties = match &event.payload {
            EventPayload::Opaque(_) => return Ok(None),
            _ => entity_keys(event)?,
        };
        let occurred_at = event.occurred_at;

        let kind = match &event.payload {
            EventPayload::EmployeeCreated(body) => {
                properties.insert("employee_number".into(), body.employee_number.clone().into());
                properties.insert("first_name".into(), body.first_name.clone().into());
                properties.insert("last_name".into(), body.last_name.clone().into());
                properties.insert("email".into(), body.email.clone().into());
                properties.insert("hire_date".into(), body.hire_date.map(|d| d.to_string()).into());
                properties.insert("status".into(), body.status.clone().into());
                properties.insert("created_at".into(), occurred_at.into());
                SyncOperationKind::Create
            }
            EventPayload::EmployeeUpdated(body) => {
                let fields = updated_properties(&body.updated_fields);
                if fields.is_empty() {
                    debug!(event_id = %event.event_id, "Employee update carries no fields");
                    return Ok(None);
                }
                properties.extend(fields);
                SyncOperationKind::Update
            }
            EventPayload::EmployeeDeleted(body) => {
                properties.insert("status".into(), "DELETED".into());
                properties.insert("deletion_reason".into(), body.reason.clone().into());
                SyncOperationKind::Delete
            }
            EventPayload::EmployeeHired(body) => {
                properties.insert("status".into(), "ACTIVE".into());
                properties.insert("hire_date".into(), body.hire_date.to_string().into());
                properties.insert("position_id".into(), body.position_id.into());
                properties.insert("hired_at".into(), occurred_at.into());
                SyncOperationKind::Update
            }
            EventPayload::EmployeeTerminated(body) => {
                properties.insert("status".into(), "TERMINATED".into());
                properties.insert(
                    "termination_date".into(),
                    body.termination_date.to_string().into(),
                );
                properties.insert("termination_reason".into(), body.reason.clone().into());
                properties.insert("terminated_at".into(), occurred_at.into());
                SyncOperationKind::Update
            }
            EventPayload::EmployeePhoneUpdated(body) => {
                properties.insert("phone_number".into(), body.phone_number.clone().into());
                properties.insert("phone_updated_at".into(), occurred_at.into());
                SyncOperationKind::Update
            }
            other => {
                return Err(ConsumerError::invalid_event(
                    event,
                    format!("{} payload is not an employee event", other.name()),
                ));
            }
        };

        Ok(Some(self.batch(kind, properties, event)?))
    }

    fn batch(
        &self,
        kind: SyncOperationKind,
        properties: Properties,
        event: &DomainEvent,
    ) -> Result<MutationBatch, ConsumerError> {
        let operation = NodeSyncOperation::new(EMPLOYEE_LABEL, kind, &KEYS, properties)
            .with_stamp(stamp_of(event));
        Ok(MutationBatch::new(vec![
            GraphMutation::Node(operation),
            audit(EMPLOYEE_AUDIT_LABEL, event)?,
        ]))
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError> {
        self.state.ensure_running()?;
        let Some(batch) = self.mutations_for(event)? else {
            return Ok(ConsumeOutcome::Ignored);
        };

        let outcomes = self.connection.execute_write(&batch).await?;
        if let Some(node) = outcomes.first() {
            if node.matched + node.created == 0 {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    employee_id = %event.aggregate_id,
                    "Employee node not found in graph, update skipped"
                );
            } else if node.is_noop() {
                debug!(
                    event_id = %event.event_id,
                    employee_id = %event.aggregate_id,
                    "Employee event is stale or targets a deleted node"
                );
            }
        }
        Ok(ConsumeOutcome::Applied)
    }
}

#[async_trait]
impl EventConsumer for EmployeeGraphConsumer {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn event_pattern(&self) -> &str {
        self.state.pattern()
    }

    async fn consume(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError> {
        let result = self.apply(event).await;
        self.state.record(&result);
        result
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        self.state.start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        self.state.stop();
        Ok(())
    }

    async fn health(&self) -> Result<(), ConsumerError> {
        self.state.ensure_running()?;
        self.connection
            .health_check()
            .await
            .map_err(|e| ConsumerError::Unhealthy {
                name: self.state.name().to_string(),
                reason: e.to_string(),
            })
    }

    fn stats(&self) -> ConsumerStats {
        self.state.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MockConnectionManager;
    use chrono::{Duration, NaiveDate, Utc};
    use cube_castle_sync_domain::events::{
        EmployeeCreated, EmployeeDeleted, EmployeeTerminated, EmployeeUpdated,
    };
    use cube_castle_sync_domain::graph_sync::{CountNodes, FindNode, NodeRef};
    use cube_castle_sync_domain::props;
    use serde_json::json;
    use uuid::Uuid;

    fn created() -> EventPayload {
        EventPayload::EmployeeCreated(EmployeeCreated {
            employee_number: "E-001".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            hire_date: NaiveDate::from_ymd_opt(2024, 1, 15),
            status: "ACTIVE".into(),
        })
    }

    struct Fixture {
        manager: Arc<MockConnectionManager>,
        consumer: EmployeeGraphConsumer,
        tenant: Uuid,
    }

    impl Fixture {
        async fn new() -> Self {
            let manager = Arc::new(MockConnectionManager::default());
            let consumer = EmployeeGraphConsumer::new(manager.clone());
            consumer.start().await.unwrap();
            Self {
                manager,
                consumer,
                tenant: Uuid::new_v4(),
            }
        }

        fn event(&self, event_type: &str, payload: EventPayload, minutes: i64) -> DomainEvent {
            DomainEvent::new(event_type, "employee", "emp-1", payload)
                .with_tenant(self.tenant)
                .with_occurred_at(Utc::now() + Duration::minutes(minutes))
        }

        async fn node(&self) -> Properties {
            let node = NodeRef::new(
                EMPLOYEE_LABEL,
                props! { "id" => "emp-1", "tenant_id" => self.tenant },
            );
            self.manager
                .execute_read(&FindNode(node))
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_created_event_upserts_node_and_audit() {
        let fx = Fixture::new().await;
        let event = fx.event(employee_events::CREATED, created(), 0);

        let outcome = fx.consumer.consume(&event).await.unwrap();
        // Redelivery of the same event
        fx.consumer.consume(&event).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Applied);
        let node = fx.node().await;
        assert_eq!(node["first_name"].as_str(), Some("Ada"));
        assert_eq!(node["hire_date"].as_str(), Some("2024-01-15"));
        assert_eq!(
            fx.manager.execute_read(&CountNodes(EMPLOYEE_LABEL.into())).await.unwrap(),
            1
        );
        assert_eq!(
            fx.manager
                .execute_read(&CountNodes(EMPLOYEE_AUDIT_LABEL.into()))
                .await
                .unwrap(),
            1
        );
        assert_eq!(fx.consumer.stats().processed, 2);
    }

    #[tokio::test]
    async fn test_late_update_does_not_resurrect_deleted_employee() {
        let fx = Fixture::new().await;
        fx.consumer
            .consume(&fx.event(employee_events::CREATED, created(), 0))
            .await
            .unwrap();
        fx.consumer
            .consume(&fx.event(
                employee_events::DELETED,
                EventPayload::EmployeeDeleted(EmployeeDeleted {
                    reason: Some("duplicate record".into()),
                }),
                10,
            ))
            .await
            .unwrap();

        let update = EventPayload::EmployeeUpdated(EmployeeUpdated {
            updated_fields: [("email".to_string(), json!("late@example.com"))].into(),
        });
        fx.consumer
            .consume(&fx.event(employee_events::UPDATED, update, 5))
            .await
            .unwrap();

        let node = fx.node().await;
        assert_eq!(node["status"].as_str(), Some("DELETED"));
        assert_eq!(node["is_deleted"].as_bool(), Some(true));
        assert_eq!(node["email"].as_str(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn test_terminated_event_sets_status() {
        let fx = Fixture::new().await;
        fx.consumer
            .consume(&fx.event(employee_events::CREATED, created(), 0))
            .await
            .unwrap();
        fx.consumer
            .consume(&fx.event(
                employee_events::TERMINATED,
                EventPayload::EmployeeTerminated(EmployeeTerminated {
                    termination_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
                    reason: Some("resigned".into()),
                }),
                1,
            ))
            .await
            .unwrap();

        let node = fx.node().await;
        assert_eq!(node["status"].as_str(), Some("TERMINATED"));
        assert_eq!(node["termination_reason"].as_str(), Some("resigned"));
        assert!(node.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_unknown_employee_event_is_ignored() {
        let fx = Fixture::new().await;
        let event = fx.event("employee.archived", EventPayload::Opaque(json!({})), 0);

        assert_eq!(fx.consumer.consume(&event).await.unwrap(), ConsumeOutcome::Ignored);
        assert_eq!(fx.manager.snapshot().await.node_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let fx = Fixture::new().await;
        let event = DomainEvent::new(employee_events::CREATED, "employee", "emp-1", created());

        assert!(matches!(
            fx.consumer.consume(&event).await,
            Err(ConsumerError::InvalidEvent { .. })
        ));
        assert_eq!(fx.consumer.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_stopped_consumer_refuses_events() {
        let fx = Fixture::new().await;
        fx.consumer.stop().await.unwrap();

        let event = fx.event(employee_events::CREATED, created(), 0);
        assert!(matches!(
            fx.consumer.consume(&event).await,
            Err(ConsumerError::Stopped(_))
        ));
        assert!(fx.consumer.health().await.is_err());
        assert!(fx.consumer.handles(employee_events::PHONE_UPDATED));
        assert!(!fx.consumer.handles("organization.created"));
    }
}
