//! Node sync operations
//!
//! A [`NodeSyncOperation`] is the store-independent description of one
//! node write: which label, which kind of write, which properties identify
//! the node and which are written.

use super::GraphError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Scalar property stored on a node or relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Convert a JSON value; arrays and objects are stored as JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => PropertyValue::Text(s.clone()),
            other => PropertyValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Int(i) => serde_json::Value::from(*i),
            PropertyValue::Float(f) => serde_json::Value::from(*f),
            PropertyValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::Text(value.to_rfc3339())
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PropertyValue::Null)
    }
}

/// Property map of a graph entity
pub type Properties = BTreeMap<String, PropertyValue>;

/// Build a [`Properties`] map from `key => value` pairs.
#[macro_export]
macro_rules! props {
    () => { $crate::graph_sync::Properties::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::graph_sync::Properties::new();
        $( map.insert(($key).to_string(), $crate::graph_sync::PropertyValue::from($value)); )+
        map
    }};
}

/// Names interpolated into queries must be plain identifiers.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncOperationKind {
    /// Upsert on the unique keys
    Create,
    /// Update of an existing node; a missing node matches nothing
    Update,
    /// Soft delete: the node is flagged, never removed
    Delete,
}

impl fmt::Display for SyncOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperationKind::Create => write!(f, "CREATE"),
            SyncOperationKind::Update => write!(f, "UPDATE"),
            SyncOperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Event identity written on every entity the event touches
///
/// Stored as `last_event_id` / `last_event_at` (epoch milliseconds) and
/// used to drop writes older than the one already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventStamp {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventStamp {
    pub fn new(event_id: Uuid, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id,
            occurred_at,
        }
    }

    pub fn millis(&self) -> i64 {
        self.occurred_at.timestamp_millis()
    }
}

/// Identity of one node: a label plus the values of its unique keys
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    pub label: String,
    pub keys: Properties,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, keys: Properties) -> Self {
        Self {
            label: label.into(),
            keys,
        }
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if !is_identifier(&self.label) {
            return Err(GraphError::Validation(format!(
                "invalid label '{}'",
                self.label
            )));
        }
        if self.keys.is_empty() {
            return Err(GraphError::Validation(format!(
                "node reference on '{}' has no keys",
                self.label
            )));
        }
        if let Some(bad) = self.keys.keys().find(|k| !is_identifier(k)) {
            return Err(GraphError::Validation(format!("invalid key '{}'", bad)));
        }
        Ok(())
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.label)?;
        for (key, value) in &self.keys {
            write!(f, " {}={}", key, value)?;
        }
        write!(f, ")")
    }
}

/// One node write
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSyncOperation {
    pub label: String,
    pub kind: SyncOperationKind,
    /// Property names that identify the node
    pub unique_keys: Vec<String>,
    pub properties: Properties,
    pub stamp: Option<EventStamp>,
}

impl NodeSyncOperation {
    pub fn new(
        label: impl Into<String>,
        kind: SyncOperationKind,
        unique_keys: &[&str],
        properties: Properties,
    ) -> Self {
        Self {
            label: label.into(),
            kind,
            unique_keys: unique_keys.iter().map(|k| k.to_string()).collect(),
            properties,
            stamp: None,
        }
    }

    pub fn create(label: impl Into<String>, unique_keys: &[&str], properties: Properties) -> Self {
        Self::new(label, SyncOperationKind::Create, unique_keys, properties)
    }

    pub fn update(label: impl Into<String>, unique_keys: &[&str], properties: Properties) -> Self {
        Self::new(label, SyncOperationKind::Update, unique_keys, properties)
    }

    /// `properties` must hold the unique key values; other entries are
    /// written alongside the deletion flag.
    pub fn delete(label: impl Into<String>, unique_keys: &[&str], properties: Properties) -> Self {
        Self::new(label, SyncOperationKind::Delete, unique_keys, properties)
    }

    pub fn with_stamp(mut self, stamp: EventStamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    /// Check the operation before any store sees it.
    ///
    /// Label and property names must be identifiers, at least one unique key
    /// is required, and every unique key needs a non-null value.
    pub fn validate(&self) -> Result<(), GraphError> {
        if !is_identifier(&self.label) {
            return Err(GraphError::Validation(format!(
                "invalid label '{}'",
                self.label
            )));
        }
        if self.unique_keys.is_empty() {
            return Err(GraphError::Validation(format!(
                "{} on '{}' has no unique keys",
                self.kind, self.label
            )));
        }
        if let Some(bad) = self.properties.keys().find(|k| !is_identifier(k)) {
            return Err(GraphError::Validation(format!(
                "invalid property name '{}'",
                bad
            )));
        }
        for key in &self.unique_keys {
            match self.properties.get(key) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(GraphError::Validation(format!(
                        "{} on '{}' is missing a value for unique key '{}'",
                        self.kind, self.label, key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.label.clone(), self.key_properties())
    }

    pub fn key_properties(&self) -> Properties {
        self.properties
            .iter()
            .filter(|(k, _)| self.unique_keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Properties written by the operation, unique keys excluded
    pub fn write_properties(&self) -> Properties {
        self.properties
            .iter()
            .filter(|(k, _)| !self.unique_keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
