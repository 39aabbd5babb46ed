//! Typed event bodies
//!
//! The aggregate identity and tenant travel in the envelope; bodies only
//! carry the business fields of each event. Unknown fields are ignored so
//! producers may add data without breaking the consumers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

fn default_employee_status() -> String {
    "ACTIVE".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeCreated {
    pub employee_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub hire_date: Option<NaiveDate>,
    #[serde(default = "default_employee_status")]
    pub status: String,
}

/// Partial update; keys are graph property names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeUpdated {
    pub updated_fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmployeeDeleted {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeHired {
    pub hire_date: NaiveDate,
    #[serde(default)]
    pub position_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeTerminated {
    pub termination_date: NaiveDate,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeePhoneUpdated {
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCreated {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub parent_org_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationUpdated {
    pub updated_fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationDeleted {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationRestructured {
    /// `None` detaches the unit from its parent
    #[serde(default)]
    pub new_parent_org_id: Option<Uuid>,
    pub restructure_type: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationStatusChanged {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Decoded body of a bus event
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    EmployeeCreated(EmployeeCreated),
    EmployeeUpdated(EmployeeUpdated),
    EmployeeDeleted(EmployeeDeleted),
    EmployeeHired(EmployeeHired),
    EmployeeTerminated(EmployeeTerminated),
    EmployeePhoneUpdated(EmployeePhoneUpdated),
    OrganizationCreated(OrganizationCreated),
    OrganizationUpdated(OrganizationUpdated),
    OrganizationDeleted(OrganizationDeleted),
    OrganizationRestructured(OrganizationRestructured),
    OrganizationActivated(OrganizationStatusChanged),
    OrganizationDeactivated(OrganizationStatusChanged),
    /// Event type with no registered decoder; the raw body is kept
    Opaque(serde_json::Value),
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::EmployeeCreated(_) => "EmployeeCreated",
            EventPayload::EmployeeUpdated(_) => "EmployeeUpdated",
            EventPayload::EmployeeDeleted(_) => "EmployeeDeleted",
            EventPayload::EmployeeHired(_) => "EmployeeHired",
            EventPayload::EmployeeTerminated(_) => "EmployeeTerminated",
            EventPayload::EmployeePhoneUpdated(_) => "EmployeePhoneUpdated",
            EventPayload::OrganizationCreated(_) => "OrganizationCreated",
            EventPayload::OrganizationUpdated(_) => "OrganizationUpdated",
            EventPayload::OrganizationDeleted(_) => "OrganizationDeleted",
            EventPayload::OrganizationRestructured(_) => "OrganizationRestructured",
            EventPayload::OrganizationActivated(_) => "OrganizationActivated",
            EventPayload::OrganizationDeactivated(_) => "OrganizationDeactivated",
            EventPayload::Opaque(_) => "Opaque",
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, EventPayload::Opaque(_))
    }

    /// Serialize the body alone, without any variant tag.
    pub fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::EmployeeCreated(p) => serde_json::to_value(p),
            EventPayload::EmployeeUpdated(p) => serde_json::to_value(p),
            EventPayload::EmployeeDeleted(p) => serde_json::to_value(p),
            EventPayload::EmployeeHired(p) => serde_json::to_value(p),
            EventPayload::EmployeeTerminated(p) => serde_json::to_value(p),
            EventPayload::EmployeePhoneUpdated(p) => serde_json::to_value(p),
            EventPayload::OrganizationCreated(p) => serde_json::to_value(p),
            EventPayload::OrganizationUpdated(p) => serde_json::to_value(p),
            EventPayload::OrganizationDeleted(p) => serde_json::to_value(p),
            EventPayload::OrganizationRestructured(p) => serde_json::to_value(p),
            EventPayload::OrganizationActivated(p) | EventPayload::OrganizationDeactivated(p) => {
                serde_json::to_value(p)
            }
            EventPayload::Opaque(value) => Ok(value.clone()),
        }
    }
}
