//! Centralized event type constants
//!
//! Single source of truth for the event-type strings written into the outbox
//! by the command side and matched by the CDC consumers.
//!
//! ## Naming Convention
//! - Format: `{aggregate}.{action}` in lowercase snake case
//! - Consumer patterns use the aggregate prefix: `{aggregate}.*`
//!
//! ## Usage
//! ```rust
//! use cube_castle_shared::event_topics::{employee_events, matches_pattern};
//!
//! assert!(matches_pattern(employee_events::PATTERN, employee_events::CREATED));
//! ```

/// Aggregate type names as stored in `outbox.aggregate_type`
pub mod aggregate_types {
    pub const EMPLOYEE: &str = "employee";
    pub const ORGANIZATION: &str = "organization";
    pub const POSITION: &str = "position";
}

/// Employee event types
pub mod employee_events {
    pub const CREATED: &str = "employee.created";
    pub const UPDATED: &str = "employee.updated";
    pub const DELETED: &str = "employee.deleted";
    pub const HIRED: &str = "employee.hired";
    pub const TERMINATED: &str = "employee.terminated";
    pub const PHONE_UPDATED: &str = "employee.phone_updated";

    /// Consumer pattern for all employee events
    pub const PATTERN: &str = "employee.*";

    pub const ALL: [&str; 6] = [CREATED, UPDATED, DELETED, HIRED, TERMINATED, PHONE_UPDATED];
}

/// Organization event types
pub mod organization_events {
    pub const CREATED: &str = "organization.created";
    pub const UPDATED: &str = "organization.updated";
    pub const DELETED: &str = "organization.deleted";
    pub const RESTRUCTURED: &str = "organization.restructured";
    pub const ACTIVATED: &str = "organization.activated";
    pub const DEACTIVATED: &str = "organization.deactivated";

    /// Consumer pattern for all organization events
    pub const PATTERN: &str = "organization.*";

    pub const ALL: [&str; 6] = [CREATED, UPDATED, DELETED, RESTRUCTURED, ACTIVATED, DEACTIVATED];
}

/// Returns true when `event_type` is matched by `pattern`.
///
/// A pattern is either an exact event type or an `{aggregate}.*` prefix.
pub fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        None => pattern == event_type,
    }
}

/// Derive the `{aggregate}.*` pattern of an event type, if it has one.
pub fn pattern_for(event_type: &str) -> Option<String> {
    let (aggregate, action) = event_type.split_once('.')?;
    if aggregate.is_empty() || action.is_empty() {
        return None;
    }
    Some(format!("{}.*", aggregate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern_matching() {
        assert!(matches_pattern("employee.*", "employee.created"));
        assert!(matches_pattern("employee.*", "employee.phone_updated"));
        assert!(!matches_pattern("employee.*", "employees.created"));
        assert!(!matches_pattern("employee.*", "employee."));
        assert!(!matches_pattern("employee.*", "organization.created"));
    }

    #[test]
    fn test_exact_pattern_matching() {
        assert!(matches_pattern("organization.created", "organization.created"));
        assert!(!matches_pattern("organization.created", "organization.updated"));
    }

    #[test]
    fn test_pattern_for() {
        assert_eq!(pattern_for("employee.hired").as_deref(), Some("employee.*"));
        assert_eq!(pattern_for("noaggregate"), None);
        assert_eq!(pattern_for(".created"), None);
    }

    #[test]
    fn test_all_event_types_match_their_pattern() {
        for event_type in employee_events::ALL {
            assert!(matches_pattern(employee_events::PATTERN, event_type));
        }
        for event_type in organization_events::ALL {
            assert!(matches_pattern(organization_events::PATTERN, event_type));
        }
    }
}
