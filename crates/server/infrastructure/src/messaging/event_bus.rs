//! In-process Event Bus
//!
//! Synchronous fan-out: `publish` awaits every handler of the event type in
//! the caller's task, in subscription order, and aggregates their failures.

use async_trait::async_trait;
use cube_castle_sync_domain::event_bus::{
    EventBus, EventBusError, EventBusMetrics, EventHandler, HandlerFailure, NoopEventBusMetrics,
    PublishError,
};
use cube_castle_sync_domain::events::DomainEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type HandlerMap = HashMap<String, Vec<Arc<dyn EventHandler>>>;

pub struct InProcessEventBus {
    handlers: RwLock<HandlerMap>,
    metrics: Arc<dyn EventBusMetrics>,
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessEventBus {
    /// Bus recording into the no-op metrics sink
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopEventBusMetrics))
    }

    pub fn with_metrics(metrics: Arc<dyn EventBusMetrics>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Event types with at least one handler, sorted
    pub fn subscribed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError> {
        if event_type.is_empty() {
            return Err(EventBusError::EmptyEventType);
        }
        debug!(event_type, handler = handler.name(), "Handler subscribed");
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn publish(&self, event: &DomainEvent) -> Result<(), EventBusError> {
        if event.event_type.is_empty() {
            return Err(EventBusError::EmptyEventType);
        }

        // Snapshot so handlers may subscribe while being invoked
        let handlers: Vec<Arc<dyn EventHandler>> = match self.handlers.read().get(&event.event_type)
        {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                debug!(event_type = %event.event_type, "No handlers registered");
                self.metrics.record_no_handlers(&event.event_type);
                return Ok(());
            }
        };

        let started = Instant::now();
        let mut failures = Vec::new();
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(error) = handler.handle(event).await {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    handler_index = index,
                    handler = handler.name(),
                    error = %error,
                    "Event handler failed"
                );
                failures.push(HandlerFailure {
                    index,
                    handler: handler.name().to_string(),
                    error,
                });
            }
        }

        self.metrics
            .record_publish(&event.event_type, failures.is_empty(), started.elapsed());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError::new(event, handlers.len(), failures).into())
        }
    }

    fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.read().get(event_type).map_or(0, Vec::len)
    }
}
