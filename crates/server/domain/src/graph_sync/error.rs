use thiserror::Error;

/// Message fragments of errors worth retrying
const RETRYABLE_FRAGMENTS: [&str; 6] = [
    "connection",
    "timeout",
    "timed out",
    "temporary",
    "network",
    "unavailable",
];

/// Classification consulted by the retry policy
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Errors of the secondary graph store
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed [{code}]: {message}")]
    Query { code: String, message: String },

    #[error("Invalid graph operation: {0}")]
    Validation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Connection manager is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

fn message_is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

impl Retryable for GraphError {
    fn is_retryable(&self) -> bool {
        match self {
            GraphError::Connection(_) | GraphError::Timeout(_) | GraphError::Unavailable(_) => true,
            GraphError::Query { code, message } => {
                code.contains("TransientError") || message_is_transient(message)
            }
            GraphError::Transaction(message) | GraphError::Other(message) => {
                message_is_transient(message)
            }
            GraphError::Validation(_) | GraphError::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(GraphError::Connection("refused".into()).is_retryable());
        assert!(GraphError::Timeout("30s".into()).is_retryable());
        assert!(GraphError::Unavailable("leader switch".into()).is_retryable());
    }

    #[test]
    fn test_transient_query_codes_are_retryable() {
        let deadlock = GraphError::Query {
            code: "Neo.TransientError.Transaction.DeadlockDetected".into(),
            message: "deadlock".into(),
        };
        assert!(deadlock.is_retryable());

        let syntax = GraphError::Query {
            code: "Neo.ClientError.Statement.SyntaxError".into(),
            message: "Invalid input".into(),
        };
        assert!(!syntax.is_retryable());
    }

    #[test]
    fn test_message_classification() {
        assert!(GraphError::Other("Network is unreachable".into()).is_retryable());
        assert!(GraphError::Transaction("temporary failure".into()).is_retryable());
        assert!(!GraphError::Other("constraint violated".into()).is_retryable());
        assert!(!GraphError::Validation("connection".into()).is_retryable());
        assert!(!GraphError::Closed.is_retryable());
    }
}
