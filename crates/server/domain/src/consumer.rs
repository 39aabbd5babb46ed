//! CDC consumer contract
//!
//! A consumer turns the bus events of one aggregate into graph writes.

use crate::events::DomainEvent;
use crate::graph_sync::{GraphError, RetryError, Retryable};
use async_trait::async_trait;
use cube_castle_shared::matches_pattern;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("a consumer is already registered for pattern '{0}'")]
    DuplicateConsumer(String),

    #[error("invalid consumer pattern '{0}'")]
    InvalidPattern(String),

    #[error("event {event_id} ({event_type}) cannot be consumed: {reason}")]
    InvalidEvent {
        event_id: Uuid,
        event_type: String,
        reason: String,
    },

    #[error("consumer '{0}' is not running")]
    Stopped(String),

    #[error("consumer '{name}' is unhealthy: {reason}")]
    Unhealthy { name: String, reason: String },

    #[error("consumer manager is already running")]
    AlreadyRunning,

    #[error("consumer manager is not running")]
    NotRunning,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Retry(Box<RetryError<ConsumerError>>),
}

impl ConsumerError {
    pub fn invalid_event(event: &DomainEvent, reason: impl Into<String>) -> Self {
        ConsumerError::InvalidEvent {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            reason: reason.into(),
        }
    }
}

impl Retryable for ConsumerError {
    fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Graph(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<RetryError<ConsumerError>> for ConsumerError {
    fn from(err: RetryError<ConsumerError>) -> Self {
        match err {
            RetryError::Fatal(inner) => inner,
            other => ConsumerError::Retry(Box::new(other)),
        }
    }
}

/// Result of consuming one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumeOutcome {
    /// Graph writes were committed
    Applied,
    /// The event type is matched by the pattern but carries nothing to write
    Ignored,
}

/// Counters of one consumer
///
/// Counts are per `consume` call. An event retried by the manager counts
/// every failed attempt in `failed` and its final outcome once; per-event
/// outcomes are in the manager's graph sync metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub name: String,
    pub pattern: String,
    pub running: bool,
    pub processed: u64,
    pub ignored: u64,
    /// Failed attempts, including those later retried successfully
    pub failed: u64,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Exact event type or `{aggregate}.*`
    fn event_pattern(&self) -> &str;

    fn handles(&self, event_type: &str) -> bool {
        matches_pattern(self.event_pattern(), event_type)
    }

    async fn consume(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError>;

    async fn start(&self) -> Result<(), ConsumerError>;

    async fn stop(&self) -> Result<(), ConsumerError>;

    async fn health(&self) -> Result<(), ConsumerError>;

    fn stats(&self) -> ConsumerStats;
}
