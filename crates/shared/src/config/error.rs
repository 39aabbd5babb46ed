//! Configuration errors
//!
//! The process refuses to boot on any of these.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {var}")]
    MissingRequired { var: String },

    /// The variable is set but cannot be parsed
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load .env file from {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    /// Values parse but break a cross-field or range rule
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    #[error("Invalid graph URI: {0}")]
    InvalidUrl(String),

    #[error("Invalid PostgreSQL URL: {0}")]
    InvalidDatabaseUrl(String),
}

impl ConfigError {
    pub(crate) fn invalid(var: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_display() {
        let err = ConfigError::MissingRequired {
            var: "CUBE_CASTLE_DATABASE_URL".to_string(),
        };
        assert!(err.to_string().contains("CUBE_CASTLE_DATABASE_URL"));
        assert!(err.to_string().contains("Missing required"));
    }

    #[test]
    fn test_invalid_value_display() {
        let err = ConfigError::invalid("OUTBOX_BATCH_SIZE", "abc", "expected a positive integer");
        let msg = err.to_string();
        assert!(msg.contains("OUTBOX_BATCH_SIZE"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("positive integer"));
    }

    #[test]
    fn test_validation_display() {
        let err = ConfigError::Validation("batch size must be > 0".to_string());
        assert!(err.to_string().contains("batch size must be > 0"));
    }
}
