//! Graph write intermediate representation
//!
//! Consumers describe what an event changes as a list of
//! [`GraphMutation`]s; each backend knows how to apply them.

use super::operation::{EventStamp, NodeRef, NodeSyncOperation, Properties, is_identifier};
use super::GraphError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Relationships pointing at the node
    Incoming,
    /// Relationships leaving the node
    Outgoing,
    Both,
}

/// Every write a consumer may ask of the graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    /// Create, update or soft-delete one node
    Node(NodeSyncOperation),

    /// Merge `(from)-[:rel_type]->(to)`, reviving it if it was retired.
    ///
    /// Matches nothing when either endpoint is missing.
    Link {
        rel_type: String,
        from: NodeRef,
        to: NodeRef,
        properties: Properties,
        stamp: EventStamp,
    },

    /// Flag live relationships of a node as deleted
    RetireRelationships {
        node: NodeRef,
        /// `None` retires every relationship type
        rel_type: Option<String>,
        direction: Direction,
        stamp: EventStamp,
    },

    /// Append-only audit node keyed by event id
    Audit(AuditRecord),
}

impl GraphMutation {
    pub fn validate(&self) -> Result<(), GraphError> {
        match self {
            GraphMutation::Node(op) => op.validate(),
            GraphMutation::Link {
                rel_type, from, to, properties, ..
            } => {
                validate_rel_type(rel_type)?;
                from.validate()?;
                to.validate()?;
                validate_names(properties)
            }
            GraphMutation::RetireRelationships { node, rel_type, .. } => {
                if let Some(rel_type) = rel_type {
                    validate_rel_type(rel_type)?;
                }
                node.validate()
            }
            GraphMutation::Audit(record) => {
                if !is_identifier(&record.label) {
                    return Err(GraphError::Validation(format!(
                        "invalid audit label '{}'",
                        record.label
                    )));
                }
                validate_names(&record.properties)
            }
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            GraphMutation::Node(op) => format!("{} {}", op.kind, op.node_ref()),
            GraphMutation::Link { rel_type, from, to, .. } => {
                format!("LINK {}-[:{}]->{}", from, rel_type, to)
            }
            GraphMutation::RetireRelationships { node, rel_type, .. } => format!(
                "RETIRE {} [:{}]",
                node,
                rel_type.as_deref().unwrap_or("*")
            ),
            GraphMutation::Audit(record) => format!("AUDIT {} {}", record.label, record.event_id),
        }
    }
}

fn validate_rel_type(rel_type: &str) -> Result<(), GraphError> {
    if is_identifier(rel_type) {
        Ok(())
    } else {
        Err(GraphError::Validation(format!(
            "invalid relationship type '{}'",
            rel_type
        )))
    }
}

fn validate_names(properties: &Properties) -> Result<(), GraphError> {
    match properties.keys().find(|k| !is_identifier(k)) {
        Some(bad) => Err(GraphError::Validation(format!(
            "invalid property name '{}'",
            bad
        ))),
        None => Ok(()),
    }
}

/// Audit trail entry
///
/// Written with create-only semantics: a redelivered event leaves the
/// existing record untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub label: String,
    pub event_id: Uuid,
    pub properties: Properties,
}

/// What a mutation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Entities that existed and were matched
    pub matched: u64,
    /// Entities created by the mutation
    pub created: u64,
    /// Entities actually written; lower than `matched + created` when the
    /// stale-event or deletion guard skipped a write
    pub applied: u64,
}

impl MutationOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied == 0
    }
}

/// A node reached through one relationship
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node: Properties,
    pub relationship: Properties,
}
