//! Cypher compilation of graph mutations and reads
//!
//! Labels, relationship types and property names are interpolated into the
//! statement text only after validation as identifiers; every value travels
//! as a parameter.
//!
//! Entity bookkeeping properties:
//! - `last_event_at` (epoch ms) / `last_event_id`: newest event applied
//! - `is_deleted`, `deleted_at`, `deleted_by_event_id`: soft delete
//! - `synced_at`: wall-clock time of the last graph write
//! - `updated_at`: event time of the last update

use chrono::{DateTime, Utc};
use cube_castle_sync_domain::graph_sync::{
    AuditRecord, Direction, EventStamp, GraphError, GraphMutation, MutationOutcome, NodeRef,
    NodeSyncOperation, Properties, PropertyValue, SyncOperationKind, is_identifier,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;

/// One parameterised Cypher statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CypherStatement {
    #[serde(rename = "statement")]
    pub text: String,
    pub parameters: Map<String, Value>,
}

impl CypherStatement {
    fn new() -> Self {
        Self {
            text: String::new(),
            parameters: Map::new(),
        }
    }

    fn param(&mut self, name: impl Into<String>, value: Value) {
        self.parameters.insert(name.into(), value);
    }

    fn line(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(text);
    }
}

/// `(var:Label {key: $var_key, ...})`, binding the key parameters
fn node_pattern(stmt: &mut CypherStatement, var: &str, node: &NodeRef) -> String {
    let keys: Vec<String> = node
        .keys
        .iter()
        .map(|(key, value)| {
            let name = format!("{}_{}", var, key);
            stmt.param(name.clone(), value.to_json());
            format!("{}: ${}", key, name)
        })
        .collect();
    format!("({}:{} {{{}}})", var, node.label, keys.join(", "))
}

/// `var.key = $prefix_key` assignments, binding the parameters
fn assignments(
    stmt: &mut CypherStatement,
    var: &str,
    prefix: &str,
    properties: &Properties,
) -> Vec<String> {
    properties
        .iter()
        .map(|(key, value)| {
            let name = format!("{}_{}", prefix, key);
            stmt.param(name.clone(), value.to_json());
            format!("{}.{} = ${}", var, key, name)
        })
        .collect()
}

fn bind_stamp(stmt: &mut CypherStatement, stamp: &EventStamp) {
    stmt.param("event_at", Value::from(stamp.millis()));
    stmt.param("event_id", Value::String(stamp.event_id.to_string()));
}

fn stamp_assignments(var: &str) -> Vec<String> {
    vec![
        format!("{}.last_event_at = $event_at", var),
        format!("{}.last_event_id = $event_id", var),
    ]
}

fn conditional_set(var_test: &str, sets: &[String]) -> String {
    format!(
        "FOREACH (ignored IN CASE WHEN {} THEN [1] ELSE [] END | SET {})",
        var_test,
        sets.join(", ")
    )
}

/// Compile one mutation. `now` stamps `synced_at` and audit records.
pub fn compile_mutation(
    mutation: &GraphMutation,
    now: DateTime<Utc>,
) -> Result<CypherStatement, GraphError> {
    mutation.validate()?;
    let statement = match mutation {
        GraphMutation::Node(op) => compile_node(op, now),
        GraphMutation::Link {
            rel_type,
            from,
            to,
            properties,
            stamp,
        } => compile_link(rel_type, from, to, properties, stamp),
        GraphMutation::RetireRelationships {
            node,
            rel_type,
            direction,
            stamp,
        } => compile_retire(node, rel_type.as_deref(), *direction, stamp),
        GraphMutation::Audit(record) => compile_audit(record, now),
    };
    Ok(statement)
}

fn compile_node(op: &NodeSyncOperation, now: DateTime<Utc>) -> CypherStatement {
    let mut stmt = CypherStatement::new();
    let node = op.node_ref();
    stmt.param("synced_at", Value::String(now.to_rfc3339()));

    let mut sets = assignments(&mut stmt, "n", "p", &op.write_properties());
    sets.push("n.synced_at = $synced_at".to_string());

    let mut fresh = "coalesce(n.is_deleted, false) = false".to_string();
    if let Some(stamp) = &op.stamp {
        bind_stamp(&mut stmt, stamp);
        if op.kind != SyncOperationKind::Delete {
            fresh.push_str(" AND coalesce(n.last_event_at, 0) <= $event_at");
        }
        sets.extend(stamp_assignments("n"));
    }

    match op.kind {
        SyncOperationKind::Create => {
            let existing = node_pattern(&mut stmt, "n", &node).replacen("(n:", "(existing:", 1);
            let merge = node_pattern(&mut stmt, "n", &node);
            stmt.line(&format!("OPTIONAL MATCH {}", existing));
            stmt.line("WITH count(existing) AS before");
            stmt.line(&format!("MERGE {}", merge));
            stmt.line(&format!("WITH n, before, {} AS fresh", fresh));
            stmt.line(&conditional_set("fresh", &sets));
            stmt.line(
                "RETURN before AS matched, CASE WHEN before = 0 THEN 1 ELSE 0 END AS created, \
                 CASE WHEN fresh THEN 1 ELSE 0 END AS applied",
            );
        }
        SyncOperationKind::Update => {
            let updated_at = op.stamp.map(|s| s.occurred_at).unwrap_or(now);
            stmt.param("updated_at", Value::String(updated_at.to_rfc3339()));
            sets.push("n.updated_at = $updated_at".to_string());

            let pattern = node_pattern(&mut stmt, "n", &node);
            stmt.line(&format!("MATCH {}", pattern));
            stmt.line(&format!("WITH n, {} AS fresh", fresh));
            stmt.line(&conditional_set("fresh", &sets));
            stmt.line(
                "RETURN count(n) AS matched, 0 AS created, \
                 sum(CASE WHEN fresh THEN 1 ELSE 0 END) AS applied",
            );
        }
        SyncOperationKind::Delete => {
            let deleted_at = op.stamp.map(|s| s.occurred_at).unwrap_or(now);
            stmt.param("deleted_at", Value::String(deleted_at.to_rfc3339()));
            sets.push("n.is_deleted = true".to_string());
            sets.push("n.deleted_at = $deleted_at".to_string());
            if op.stamp.is_some() {
                sets.push("n.deleted_by_event_id = $event_id".to_string());
            }

            let pattern = node_pattern(&mut stmt, "n", &node);
            stmt.line(&format!("MATCH {}", pattern));
            stmt.line(&format!("WITH n, {} AS fresh", fresh));
            stmt.line(&conditional_set("fresh", &sets));
            stmt.line(
                "RETURN count(n) AS matched, 0 AS created, \
                 sum(CASE WHEN fresh THEN 1 ELSE 0 END) AS applied",
            );
        }
    }
    stmt
}

fn compile_link(
    rel_type: &str,
    from: &NodeRef,
    to: &NodeRef,
    properties: &Properties,
    stamp: &EventStamp,
) -> CypherStatement {
    let mut stmt = CypherStatement::new();
    bind_stamp(&mut stmt, stamp);
    let from_pattern = node_pattern(&mut stmt, "a", from);
    let to_pattern = node_pattern(&mut stmt, "b", to);

    let mut sets = assignments(&mut stmt, "r", "r", properties);
    sets.push("r.is_deleted = false".to_string());
    sets.extend(stamp_assignments("r"));

    stmt.line(&format!("MATCH {}", from_pattern));
    stmt.line(&format!("MATCH {}", to_pattern));
    stmt.line(&format!("MERGE (a)-[r:{}]->(b)", rel_type));
    stmt.line("WITH r, coalesce(r.last_event_at, 0) <= $event_at AS fresh");
    stmt.line(&conditional_set("fresh", &sets));
    stmt.line(
        "RETURN count(r) AS matched, 0 AS created, \
         sum(CASE WHEN fresh THEN 1 ELSE 0 END) AS applied",
    );
    stmt
}

fn relationship_pattern(rel_type: Option<&str>, direction: Direction) -> String {
    let rel = match rel_type {
        Some(rel_type) => format!("[r:{}]", rel_type),
        None => "[r]".to_string(),
    };
    match direction {
        Direction::Incoming => format!("<-{}-(m)", rel),
        Direction::Outgoing => format!("-{}->(m)", rel),
        Direction::Both => format!("-{}-(m)", rel),
    }
}

fn compile_retire(
    node: &NodeRef,
    rel_type: Option<&str>,
    direction: Direction,
    stamp: &EventStamp,
) -> CypherStatement {
    let mut stmt = CypherStatement::new();
    bind_stamp(&mut stmt, stamp);
    stmt.param("deleted_at", Value::String(stamp.occurred_at.to_rfc3339()));
    let pattern = node_pattern(&mut stmt, "n", node);

    stmt.line(&format!(
        "MATCH {}{}",
        pattern,
        relationship_pattern(rel_type, direction)
    ));
    stmt.line(
        "WHERE coalesce(r.is_deleted, false) = false AND coalesce(r.last_event_at, 0) <= $event_at",
    );
    stmt.line(
        "SET r.is_deleted = true, r.deleted_at = $deleted_at, \
         r.last_event_at = $event_at, r.last_event_id = $event_id",
    );
    stmt.line("RETURN count(r) AS matched, 0 AS created, count(r) AS applied");
    stmt
}

fn compile_audit(record: &AuditRecord, now: DateTime<Utc>) -> CypherStatement {
    let mut stmt = CypherStatement::new();
    stmt.param("event_id", Value::String(record.event_id.to_string()));
    stmt.param("recorded_at", Value::String(now.to_rfc3339()));

    let mut sets = assignments(&mut stmt, "a", "p", &record.properties);
    sets.push("a.recorded_at = $recorded_at".to_string());

    stmt.line(&format!("MERGE (a:{} {{event_id: $event_id}})", record.label));
    stmt.line(&format!("ON CREATE SET {}", sets.join(", ")));
    stmt.line("WITH a, CASE WHEN a.recorded_at = $recorded_at THEN 1 ELSE 0 END AS created");
    stmt.line("RETURN 1 - created AS matched, created, created AS applied");
    stmt
}

pub fn compile_find_node(node: &NodeRef) -> Result<CypherStatement, GraphError> {
    node.validate()?;
    let mut stmt = CypherStatement::new();
    let pattern = node_pattern(&mut stmt, "n", node);
    stmt.line(&format!("MATCH {}", pattern));
    stmt.line("RETURN properties(n) AS node LIMIT 1");
    Ok(stmt)
}

pub fn compile_count_nodes(label: &str) -> Result<CypherStatement, GraphError> {
    if !is_identifier(label) {
        return Err(GraphError::Validation(format!("invalid label '{}'", label)));
    }
    let mut stmt = CypherStatement::new();
    let _ = write!(stmt.text, "MATCH (n:{}) RETURN count(n) AS total", label);
    Ok(stmt)
}

pub fn compile_neighbors(
    node: &NodeRef,
    rel_type: &str,
    direction: Direction,
) -> Result<CypherStatement, GraphError> {
    node.validate()?;
    if !is_identifier(rel_type) {
        return Err(GraphError::Validation(format!(
            "invalid relationship type '{}'",
            rel_type
        )));
    }
    let mut stmt = CypherStatement::new();
    let pattern = node_pattern(&mut stmt, "n", node);
    stmt.line(&format!(
        "MATCH {}{}",
        pattern,
        relationship_pattern(Some(rel_type), direction)
    ));
    stmt.line("RETURN properties(m) AS node, properties(r) AS rel");
    Ok(stmt)
}

/// Read the `matched`/`created`/`applied` columns of a mutation result.
pub fn parse_outcome(columns: &[String], row: &[Value]) -> Result<MutationOutcome, GraphError> {
    let column = |name: &str| -> Result<u64, GraphError> {
        let index = columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| GraphError::Other(format!("missing result column '{}'", name)))?;
        row.get(index)
            .and_then(Value::as_i64)
            .map(|v| v.max(0) as u64)
            .ok_or_else(|| GraphError::Other(format!("non-integer result column '{}'", name)))
    };
    Ok(MutationOutcome {
        matched: column("matched")?,
        created: column("created")?,
        applied: column("applied")?,
    })
}

/// Convert a JSON map returned by `properties(x)`.
pub fn properties_from_json(value: &Value) -> Result<Properties, GraphError> {
    let object = value
        .as_object()
        .ok_or_else(|| GraphError::Other(format!("expected a property map, got {}", value)))?;
    Ok(object
        .iter()
        .map(|(k, v)| (k.clone(), PropertyValue::from_json(v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_castle_sync_domain::props;
    use uuid::Uuid;

    fn stamp() -> EventStamp {
        EventStamp::new(
            Uuid::nil(),
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn employee_ref() -> NodeRef {
        NodeRef::new("Employee", props! { "id" => "e-1", "tenant_id" => "t-1" })
    }

    #[test]
    fn test_create_is_guarded_upsert() {
        let op = NodeSyncOperation::create(
            "Employee",
            &["id", "tenant_id"],
            props! { "id" => "e-1", "tenant_id" => "t-1", "first_name" => "Ada" },
        )
        .with_stamp(stamp());

        let stmt = compile_mutation(&GraphMutation::Node(op), Utc::now()).unwrap();

        assert!(stmt.text.contains("OPTIONAL MATCH (existing:Employee {id: $n_id, tenant_id: $n_tenant_id})"));
        assert!(stmt.text.contains("MERGE (n:Employee {id: $n_id, tenant_id: $n_tenant_id})"));
        assert!(stmt.text.contains("coalesce(n.last_event_at, 0) <= $event_at"));
        assert!(stmt.text.contains("n.first_name = $p_first_name"));
        assert!(!stmt.text.contains("n.id = "));
        assert_eq!(stmt.parameters["n_id"], Value::from("e-1"));
        assert_eq!(stmt.parameters["p_first_name"], Value::from("Ada"));
        assert_eq!(stmt.parameters["event_at"], Value::from(1_714_557_600_000i64));
    }

    #[test]
    fn test_update_sets_updated_at_from_event_time() {
        let op = NodeSyncOperation::update(
            "Employee",
            &["id", "tenant_id"],
            props! { "id" => "e-1", "tenant_id" => "t-1", "email" => "a@b.c" },
        )
        .with_stamp(stamp());

        let stmt = compile_mutation(&GraphMutation::Node(op), Utc::now()).unwrap();

        assert!(stmt.text.starts_with("MATCH (n:Employee"));
        assert!(stmt.text.contains("n.updated_at = $updated_at"));
        assert_eq!(
            stmt.parameters["updated_at"],
            Value::from("2024-05-01T10:00:00+00:00")
        );
    }

    #[test]
    fn test_delete_ignores_event_time_ordering() {
        let op = NodeSyncOperation::delete(
            "Organization",
            &["id"],
            props! { "id" => "o-1", "status" => "DELETED" },
        )
        .with_stamp(stamp());

        let stmt = compile_mutation(&GraphMutation::Node(op), Utc::now()).unwrap();

        assert!(stmt.text.contains("n.is_deleted = true"));
        assert!(stmt.text.contains("n.deleted_by_event_id = $event_id"));
        assert!(!stmt.text.contains("<= $event_at"));
    }

    #[test]
    fn test_link_and_retire() {
        let link = GraphMutation::Link {
            rel_type: "CONTAINS".to_string(),
            from: NodeRef::new("Organization", props! { "id" => "parent" }),
            to: NodeRef::new("Organization", props! { "id" => "child" }),
            properties: props! { "since" => "2024-05-01" },
            stamp: stamp(),
        };
        let stmt = compile_mutation(&link, Utc::now()).unwrap();
        assert!(stmt.text.contains("MERGE (a)-[r:CONTAINS]->(b)"));
        assert_eq!(stmt.parameters["a_id"], Value::from("parent"));
        assert_eq!(stmt.parameters["b_id"], Value::from("child"));

        let retire = GraphMutation::RetireRelationships {
            node: NodeRef::new("Organization", props! { "id" => "child" }),
            rel_type: Some("CONTAINS".to_string()),
            direction: Direction::Incoming,
            stamp: stamp(),
        };
        let stmt = compile_mutation(&retire, Utc::now()).unwrap();
        assert!(stmt.text.starts_with("MATCH (n:Organization {id: $n_id})<-[r:CONTAINS]-(m)"));
    }

    #[test]
    fn test_audit_is_create_only() {
        let record = AuditRecord {
            label: "EmployeeEvent".to_string(),
            event_id: Uuid::nil(),
            properties: props! { "event_type" => "employee.created" },
        };
        let stmt = compile_mutation(&GraphMutation::Audit(record), Utc::now()).unwrap();
        assert!(stmt.text.starts_with("MERGE (a:EmployeeEvent {event_id: $event_id})"));
        assert!(stmt.text.contains("ON CREATE SET a.event_type = $p_event_type"));
        assert!(!stmt.text.contains("ON MATCH"));
    }

    #[test]
    fn test_invalid_names_never_compile() {
        let op = NodeSyncOperation::create("Employee", &["id"], props! { "id" => "x", "a b" => 1i64 });
        assert!(compile_mutation(&GraphMutation::Node(op), Utc::now()).is_err());
        assert!(compile_count_nodes("Employee) DETACH DELETE (n").is_err());
        assert!(compile_neighbors(&employee_ref(), "HAS-ROLE", Direction::Both).is_err());
    }

    #[test]
    fn test_parse_outcome() {
        let columns = vec!["matched".to_string(), "created".to_string(), "applied".to_string()];
        let outcome =
            parse_outcome(&columns, &[Value::from(1), Value::from(0), Value::from(1)]).unwrap();
        assert_eq!(
            outcome,
            MutationOutcome {
                matched: 1,
                created: 0,
                applied: 1
            }
        );
        assert!(parse_outcome(&columns[..2], &[Value::from(1), Value::from(0)]).is_err());
    }
}
