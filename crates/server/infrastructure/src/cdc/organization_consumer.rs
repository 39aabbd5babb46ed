//! Organization graph sync consumer
//!
//! Units are `(:Organization)` nodes; the hierarchy is
//! `(parent)-[:CONTAINS]->(child)`. A restructure retires the current
//! incoming `CONTAINS` edge before linking the new parent, and a delete
//! retires every relationship of the unit.

use super::base::{ConsumerState, audit, entity_keys, node_ref, stamp_of, updated_properties};
use async_trait::async_trait;
use cube_castle_shared::organization_events;
use cube_castle_sync_domain::consumer::{
    ConsumeOutcome, ConsumerError, ConsumerStats, EventConsumer,
};
use cube_castle_sync_domain::events::{DomainEvent, EventPayload};
use cube_castle_sync_domain::graph_sync::{
    ConnectionManager, ConnectionManagerExt, Direction, GraphMutation, MutationBatch,
    NodeSyncOperation, Properties, SyncOperationKind,
};
use cube_castle_sync_domain::props;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const ORGANIZATION_LABEL: &str = "Organization";
pub const ORGANIZATION_AUDIT_LABEL: &str = "OrganizationEvent";
pub const CONTAINS: &str = "CONTAINS";
const KEYS: [&str; 2] = ["id", "tenant_id"];

pub struct OrganizationGraphConsumer {
    connection: Arc<dyn ConnectionManager>,
    state: ConsumerState,
}

impl OrganizationGraphConsumer {
    pub fn new(connection: Arc<dyn ConnectionManager>) -> Self {
        Self {
            connection,
            state: ConsumerState::new("organization-graph-sync", organization_events::PATTERN),
        }
    }

    fn node_operation(
        &self,
        kind: SyncOperationKind,
        properties: Properties,
        event: &DomainEvent,
    ) -> GraphMutation {
        GraphMutation::Node(
            NodeSyncOperation::new(ORGANIZATION_LABEL, kind, &KEYS, properties)
                .with_stamp(stamp_of(event)),
        )
    }

    fn link_parent(&self, parent_id: Uuid, keys: &Properties, event: &DomainEvent) -> GraphMutation {
        let mut parent_keys = keys.clone();
        parent_keys.insert("id".into(), parent_id.into());
        GraphMutation::Link {
            rel_type: CONTAINS.to_string(),
            from: node_ref(ORGANIZATION_LABEL, &parent_keys),
            to: node_ref(ORGANIZATION_LABEL, keys),
            properties: props! { "since" => event.occurred_at },
            stamp: stamp_of(event),
        }
    }

    /// Graph writes for one event; `None` when there is nothing to write.
    pub fn mutations_for(&self, event: &DomainEvent) -> Result<Option<MutationBatch>, ConsumerError> {
        if event.payload.is_opaque() {
            return Ok(None);
        }
        let keys = entity_keys(event)?;
        let mut properties = keys.clone();
        let occurred_at = event.occurred_at;
        let mut mutations = Vec::new();

        match &event.payload {
            EventPayload::OrganizationCreated(body) => {
                properties.insert("name".into(), body.name.clone().into());
                properties.insert("code".into(), body.code.clone().into());
                properties.insert("description".into(), body.description.clone().into());
                properties.insert("level".into(), body.level.into());
                properties.insert("parent_org_id".into(), body.parent_org_id.into());
                properties.insert("status".into(), "ACTIVE".into());
                properties.insert("is_active".into(), true.into());
                properties.insert("created_at".into(), occurred_at.into());
                mutations.push(self.node_operation(SyncOperationKind::Create, properties, event));
                if let Some(parent_id) = body.parent_org_id {
                    mutations.push(self.link_parent(parent_id, &keys, event));
                }
            }
            EventPayload::OrganizationUpdated(body) => {
                let fields = updated_properties(&body.updated_fields);
                if fields.is_empty() {
                    debug!(event_id = %event.event_id, "Organization update carries no fields");
                    return Ok(None);
                }
                properties.extend(fields);
                mutations.push(self.node_operation(SyncOperationKind::Update, properties, event));
            }
            EventPayload::OrganizationDeleted(body) => {
                properties.insert("status".into(), "DELETED".into());
                properties.insert("is_active".into(), false.into());
                properties.insert("deletion_reason".into(), body.reason.clone().into());
                mutations.push(self.node_operation(SyncOperationKind::Delete, properties, event));
                mutations.push(GraphMutation::RetireRelationships {
                    node: node_ref(ORGANIZATION_LABEL, &keys),
                    rel_type: None,
                    direction: Direction::Both,
                    stamp: stamp_of(event),
                });
            }
            EventPayload::OrganizationRestructured(body) => {
                properties.insert("parent_org_id".into(), body.new_parent_org_id.into());
                properties.insert("restructure_type".into(), body.restructure_type.clone().into());
                properties.insert("restructure_reason".into(), body.reason.clone().into());
                properties.insert("restructured_at".into(), occurred_at.into());
                mutations.push(self.node_operation(SyncOperationKind::Update, properties, event));
                mutations.push(GraphMutation::RetireRelationships {
                    node: node_ref(ORGANIZATION_LABEL, &keys),
                    rel_type: Some(CONTAINS.to_string()),
                    direction: Direction::Incoming,
                    stamp: stamp_of(event),
                });
                if let Some(parent_id) = body.new_parent_org_id {
                    mutations.push(self.link_parent(parent_id, &keys, event));
                }
            }
            EventPayload::OrganizationActivated(body) => {
                properties.insert("status".into(), "ACTIVE".into());
                properties.insert("is_active".into(), true.into());
                properties.insert("status_reason".into(), body.reason.clone().into());
                properties.insert("activated_at".into(), occurred_at.into());
                mutations.push(self.node_operation(SyncOperationKind::Update, properties, event));
            }
            EventPayload::OrganizationDeactivated(body) => {
                properties.insert("status".into(), "INACTIVE".into());
                properties.insert("is_active".into(), false.into());
                properties.insert("status_reason".into(), body.reason.clone().into());
                properties.insert("deactivated_at".into(), occurred_at.into());
                mutations.push(self.node_operation(SyncOperationKind::Update, properties, event));
            }
            other => {
                return Err(ConsumerError::invalid_event(
                    event,
                    format!("{} payload is not an organization event", other.name()),
                ));
            }
        }

        mutations.push(audit(ORGANIZATION_AUDIT_LABEL, event)?);
        Ok(Some(MutationBatch::new(mutations)))
    }

    async fn apply(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError> {
        self.state.ensure_running()?;
        let Some(batch) = self.mutations_for(event)? else {
            return Ok(ConsumeOutcome::Ignored);
        };

        let outcomes = self.connection.execute_write(&batch).await?;
        for (mutation, outcome) in batch.mutations().iter().zip(&outcomes) {
            match mutation {
                GraphMutation::Node(_) if outcome.matched + outcome.created == 0 => warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    organization_id = %event.aggregate_id,
                    "Organization node not found in graph, update skipped"
                ),
                GraphMutation::Link { from, .. } if outcome.matched == 0 => debug!(
                    event_id = %event.event_id,
                    parent = %from,
                    "Parent organization not in graph yet, hierarchy edge skipped"
                ),
                _ => {}
            }
        }
        Ok(ConsumeOutcome::Applied)
    }
}

#[async_trait]
impl EventConsumer for OrganizationGraphConsumer {
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
    use chrono::{Duration, Utc};
    use cube_castle_sync_domain::events::{
        OrganizationCreated, OrganizationDeleted, OrganizationRestructured,
        OrganizationStatusChanged,
    };
    use cube_castle_sync_domain::graph_sync::{FindNeighbors, FindNode, NodeRef};

    struct Fixture {
        manager: Arc<MockConnectionManager>,
        consumer: OrganizationGraphConsumer,
        tenant: Uuid,
    }

    impl Fixture {
        async fn new() -> Self {
            let manager = Arc::new(MockConnectionManager::default());
            let consumer = OrganizationGraphConsumer::new(manager.clone());
            consumer.start().await.unwrap();
            Self {
                manager,
                consumer,
                tenant: Uuid::new_v4(),
            }
        }

        fn event(&self, id: Uuid, event_type: &str, payload: EventPayload, minutes: i64) -> DomainEvent {
            DomainEvent::new(event_type, "organization", id.to_string(), payload)
                .with_tenant(self.tenant)
                .with_occurred_at(Utc::now() + Duration::minutes(minutes))
        }

        async fn create(&self, id: Uuid, parent: Option<Uuid>, minutes: i64) {
            let payload = EventPayload::OrganizationCreated(OrganizationCreated {
                name: format!("Unit {}", id),
                code: "ENG".into(),
                description: None,
                level: i64::from(parent.is_some()),
                parent_org_id: parent,
            });
            self.consumer
                .consume(&self.event(id, organization_events::CREATED, payload, minutes))
                .await
                .unwrap();
        }

        fn node(&self, id: Uuid) -> NodeRef {
            NodeRef::new(
                ORGANIZATION_LABEL,
                props! { "id" => id, "tenant_id" => self.tenant },
            )
        }

        async fn live_parents(&self, id: Uuid) -> Vec<String> {
            let neighbors = self
                .manager
                .execute_read(&FindNeighbors {
                    node: self.node(id),
                    rel_type: CONTAINS.into(),
                    direction: Direction::Incoming,
                })
                .await
                .unwrap();
            neighbors
                .into_iter()
                .filter(|n| n.relationship["is_deleted"].as_bool() == Some(false))
                .filter_map(|n| n.node["id"].as_str().map(str::to_string))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_created_child_links_to_parent() {
        let fx = Fixture::new().await;
        let (root, child) = (Uuid::new_v4(), Uuid::new_v4());
        fx.create(root, None, 0).await;
        fx.create(child, Some(root), 1).await;

        assert_eq!(fx.live_parents(child).await, vec![root.to_string()]);
        let node = fx
            .manager
            .execute_read(&FindNode(fx.node(child)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node["is_active"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn test_restructure_moves_unit_to_new_parent() {
        let fx = Fixture::new().await;
        let (old_parent, new_parent, unit) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fx.create(old_parent, None, 0).await;
        fx.create(new_parent, None, 0).await;
        fx.create(unit, Some(old_parent), 1).await;

        let event = fx.event(
            unit,
            organization_events::RESTRUCTURED,
            EventPayload::OrganizationRestructured(OrganizationRestructured {
                new_parent_org_id: Some(new_parent),
                restructure_type: "MOVE".into(),
                reason: None,
            }),
            5,
        );
        fx.consumer.consume(&event).await.unwrap();
        // Redelivery keeps a single live parent
        fx.consumer.consume(&event).await.unwrap();

        assert_eq!(fx.live_parents(unit).await, vec![new_parent.to_string()]);
    }

    #[tokio::test]
    async fn test_delete_retires_all_relationships() {
        let fx = Fixture::new().await;
        let (parent, unit, child) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fx.create(parent, None, 0).await;
        fx.create(unit, Some(parent), 1).await;
        fx.create(child, Some(unit), 2).await;

        fx.consumer
            .consume(&fx.event(
                unit,
                organization_events::DELETED,
                EventPayload::OrganizationDeleted(OrganizationDeleted::default()),
                5,
            ))
            .await
            .unwrap();

        assert!(fx.live_parents(unit).await.is_empty());
        assert!(fx.live_parents(child).await.is_empty());
        let node = fx
            .manager
            .execute_read(&FindNode(fx.node(unit)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node["status"].as_str(), Some("DELETED"));
    }

    #[tokio::test]
    async fn test_deactivate_then_stale_activate() {
        let fx = Fixture::new().await;
        let unit = Uuid::new_v4();
        fx.create(unit, None, 0).await;

        let status = |event_type: &'static str, minutes: i64| {
            let payload = OrganizationStatusChanged::default();
            let payload = if event_type == organization_events::ACTIVATED {
                EventPayload::OrganizationActivated(payload)
            } else {
                EventPayload::OrganizationDeactivated(payload)
            };
            fx.event(unit, event_type, payload, minutes)
        };
        fx.consumer
            .consume(&status(organization_events::DEACTIVATED, 10))
            .await
            .unwrap();
        fx.consumer
            .consume(&status(organization_events::ACTIVATED, 5))
            .await
            .unwrap();

        let node = fx
            .manager
            .execute_read(&FindNode(fx.node(unit)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node["status"].as_str(), Some("INACTIVE"));
        assert_eq!(node["is_active"].as_bool(), Some(false));
    }

    #[test]
    fn test_employee_payload_is_invalid_here() {
        let consumer = OrganizationGraphConsumer::new(Arc::new(MockConnectionManager::default()));
        let event = DomainEvent::new(
            organization_events::UPDATED,
            "organization",
            "org-1",
            EventPayload::EmployeeDeleted(Default::default()),
        )
        .with_tenant(Uuid::new_v4());

        assert!(matches!(
            consumer.mutations_for(&event),
            Err(ConsumerError::InvalidEvent { .. })
        ));
    }
}
