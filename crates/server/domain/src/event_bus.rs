use crate::events::DomainEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a single handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("event type cannot be empty")]
    EmptyEventType,

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// One failed handler of a publish call
#[derive(Debug)]
pub struct HandlerFailure {
    /// Position of the handler in subscription order
    pub index: usize,
    pub handler: String,
    pub error: HandlerError,
}

/// Aggregate of every handler failure of one publish call
///
/// Handlers run in subscription order and a failing handler never stops
/// the ones after it, so this may carry several failures.
#[derive(Error, Debug)]
#[error(
    "{} of {} handler(s) failed for event '{}' (aggregate {}): {}",
    .failures.len(), .handler_count, .event_type, .aggregate_id, summary(.failures)
)]
pub struct PublishError {
    pub event_type: String,
    pub aggregate_id: String,
    pub handler_count: usize,
    failures: Vec<HandlerFailure>,
}

fn summary(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}: {}", f.index, f.handler, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PublishError {
    pub fn new(event: &DomainEvent, handler_count: usize, failures: Vec<HandlerFailure>) -> Self {
        Self {
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            handler_count,
            failures,
        }
    }

    pub fn failures(&self) -> &[HandlerFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<HandlerFailure> {
        self.failures
    }
}

/// Subscriber of the in-process event bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and failure reports
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// In-process publish/subscribe bus
///
/// Delivery is synchronous: `publish` returns once every handler
/// subscribed to the event type has run.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append `handler` to the handlers of `event_type`.
    ///
    /// The same handler may be subscribed several times; it is then invoked
    /// once per subscription.
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>)
    -> Result<(), EventBusError>;

    /// Deliver `event` to every handler of its type, in subscription order.
    ///
    /// No handlers is success.
    async fn publish(&self, event: &DomainEvent) -> Result<(), EventBusError>;

    fn handler_count(&self, event_type: &str) -> usize;
}

/// Observability sink of the event bus
pub trait EventBusMetrics: Send + Sync {
    fn record_publish(&self, event_type: &str, success: bool, elapsed: Duration);

    fn record_no_handlers(&self, event_type: &str);
}

/// Metrics sink used when none is injected
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBusMetrics;

impl EventBusMetrics for NoopEventBusMetrics {
    fn record_publish(&self, _event_type: &str, _success: bool, _elapsed: Duration) {}

    fn record_no_handlers(&self, _event_type: &str) {}
}
