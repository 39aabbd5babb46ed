//! In-memory property graph
//!
//! Applies [`GraphMutation`]s with the same guards the Cypher statements
//! encode, so the mock backend and the HTTP backend agree on every
//! outcome.

use chrono::{DateTime, Utc};
use cube_castle_sync_domain::graph_sync::{
    AuditRecord, Direction, EventStamp, GraphError, GraphMutation, MutationOutcome, Neighbor,
    NodeRef, NodeSyncOperation, Properties, PropertyValue, SyncOperationKind,
};

#[derive(Debug, Clone, PartialEq)]
struct StoredNode {
    label: String,
    properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
struct StoredRelationship {
    rel_type: String,
    from: usize,
    to: usize,
    properties: Properties,
}

/// Nodes and relationships held in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryGraph {
    nodes: Vec<StoredNode>,
    relationships: Vec<StoredRelationship>,
}

fn is_deleted(properties: &Properties) -> bool {
    properties
        .get("is_deleted")
        .and_then(PropertyValue::as_bool)
        .unwrap_or(false)
}

fn last_event_at(properties: &Properties) -> i64 {
    properties
        .get("last_event_at")
        .and_then(PropertyValue::as_i64)
        .unwrap_or(0)
}

fn set_stamp(properties: &mut Properties, stamp: &EventStamp) {
    properties.insert("last_event_at".into(), stamp.millis().into());
    properties.insert("last_event_id".into(), stamp.event_id.into());
}

fn one(flag: bool) -> u64 {
    u64::from(flag)
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    fn position(&self, node: &NodeRef) -> Option<usize> {
        self.nodes.iter().position(|stored| {
            stored.label == node.label
                && node
                    .keys
                    .iter()
                    .all(|(key, value)| stored.properties.get(key) == Some(value))
        })
    }

    pub fn apply(
        &mut self,
        mutation: &GraphMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome, GraphError> {
        mutation.validate()?;
        let outcome = match mutation {
            GraphMutation::Node(op) => self.apply_node(op, now),
            GraphMutation::Link {
                rel_type,
                from,
                to,
                properties,
                stamp,
            } => self.link(rel_type, from, to, properties, stamp),
            GraphMutation::RetireRelationships {
                node,
                rel_type,
                direction,
                stamp,
            } => self.retire(node, rel_type.as_deref(), *direction, stamp),
            GraphMutation::Audit(record) => self.audit(record, now),
        };
        Ok(outcome)
    }

    fn apply_node(&mut self, op: &NodeSyncOperation, now: DateTime<Utc>) -> MutationOutcome {
        let node = op.node_ref();
        let existing = self.position(&node);

        let index = match (op.kind, existing) {
            (SyncOperationKind::Create, None) => {
                self.nodes.push(StoredNode {
                    label: node.label.clone(),
                    properties: node.keys.clone(),
                });
                self.nodes.len() - 1
            }
            (_, Some(index)) => index,
            (_, None) => return MutationOutcome::default(),
        };
        let matched = one(existing.is_some());
        let created = one(existing.is_none());

        let properties = &mut self.nodes[index].properties;
        let mut fresh = !is_deleted(properties);
        if let (Some(stamp), true) = (&op.stamp, op.kind != SyncOperationKind::Delete) {
            fresh = fresh && last_event_at(properties) <= stamp.millis();
        }
        if !fresh {
            return MutationOutcome {
                matched,
                created,
                applied: 0,
            };
        }

        properties.extend(op.write_properties());
        properties.insert("synced_at".into(), now.into());
        let event_time = op.stamp.map(|s| s.occurred_at).unwrap_or(now);
        match op.kind {
            SyncOperationKind::Create => {}
            SyncOperationKind::Update => {
                properties.insert("updated_at".into(), event_time.into());
            }
            SyncOperationKind::Delete => {
                properties.insert("is_deleted".into(), true.into());
                properties.insert("deleted_at".into(), event_time.into());
                if let Some(stamp) = &op.stamp {
                    properties.insert("deleted_by_event_id".into(), stamp.event_id.into());
                }
            }
        }
        if let Some(stamp) = &op.stamp {
            set_stamp(properties, stamp);
        }

        MutationOutcome {
            matched,
            created,
            applied: 1,
        }
    }

    fn link(
        &mut self,
        rel_type: &str,
        from: &NodeRef,
        to: &NodeRef,
        properties: &Properties,
        stamp: &EventStamp,
    ) -> MutationOutcome {
        let (Some(from), Some(to)) = (self.position(from), self.position(to)) else {
            return MutationOutcome::default();
        };

        let existing = self
            .relationships
            .iter()
            .position(|r| r.rel_type == rel_type && r.from == from && r.to == to);
        let index = existing.unwrap_or_else(|| {
            self.relationships.push(StoredRelationship {
                rel_type: rel_type.to_string(),
                from,
                to,
                properties: Properties::new(),
            });
            self.relationships.len() - 1
        });

        let rel = &mut self.relationships[index].properties;
        let fresh = last_event_at(rel) <= stamp.millis();
        if fresh {
            rel.extend(properties.clone());
            rel.insert("is_deleted".into(), false.into());
            set_stamp(rel, stamp);
        }
        MutationOutcome {
            matched: 1,
            created: 0,
            applied: one(fresh),
        }
    }

    fn touches(&self, rel: &StoredRelationship, node: usize, direction: Direction) -> bool {
        match direction {
            Direction::Incoming => rel.to == node,
            Direction::Outgoing => rel.from == node,
            Direction::Both => rel.from == node || rel.to == node,
        }
    }

    fn retire(
        &mut self,
        node: &NodeRef,
        rel_type: Option<&str>,
        direction: Direction,
        stamp: &EventStamp,
    ) -> MutationOutcome {
        let Some(index) = self.position(node) else {
            return MutationOutcome::default();
        };

        let targets: Vec<usize> = self
            .relationships
            .iter()
            .enumerate()
            .filter(|(_, r)| self.touches(r, index, direction))
            .filter(|(_, r)| rel_type.is_none_or(|t| r.rel_type == t))
            .filter(|(_, r)| !is_deleted(&r.properties) && last_event_at(&r.properties) <= stamp.millis())
            .map(|(i, _)| i)
            .collect();

        for &i in &targets {
            let rel = &mut self.relationships[i].properties;
            rel.insert("is_deleted".into(), true.into());
            rel.insert("deleted_at".into(), stamp.occurred_at.into());
            set_stamp(rel, stamp);
        }

        let retired = targets.len() as u64;
        MutationOutcome {
            matched: retired,
            created: 0,
            applied: retired,
        }
    }

    fn audit(&mut self, record: &AuditRecord, now: DateTime<Utc>) -> MutationOutcome {
        let key = NodeRef::new(
            record.label.clone(),
            Properties::from([("event_id".to_string(), record.event_id.into())]),
        );
        if self.position(&key).is_some() {
            return MutationOutcome {
                matched: 1,
                created: 0,
                applied: 0,
            };
        }

        let mut properties = key.keys;
        properties.extend(record.properties.clone());
        properties.insert("recorded_at".into(), now.into());
        self.nodes.push(StoredNode {
            label: record.label.clone(),
            properties,
        });
        MutationOutcome {
            matched: 0,
            created: 1,
            applied: 1,
        }
    }

    pub fn find_node(&self, node: &NodeRef) -> Option<Properties> {
        self.position(node)
            .map(|index| self.nodes[index].properties.clone())
    }

    pub fn count_nodes(&self, label: &str) -> u64 {
        self.nodes.iter().filter(|n| n.label == label).count() as u64
    }

    pub fn neighbors(&self, node: &NodeRef, rel_type: &str, direction: Direction) -> Vec<Neighbor> {
        let Some(index) = self.position(node) else {
            return Vec::new();
        };
        self.relationships
            .iter()
            .filter(|r| r.rel_type == rel_type && self.touches(r, index, direction))
            .map(|r| {
                let other = if r.from == index { r.to } else { r.from };
                Neighbor {
                    node: self.nodes[other].properties.clone(),
                    relationship: r.properties.clone(),
                }
            })
            .collect()
    }
}
