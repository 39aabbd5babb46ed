//! Prometheus Metrics Infrastructure
//!
//! One [`MetricsRegistry`] is created at startup and passed to every
//! component that records metrics. Each metric family is registered exactly
//! once: shared families sit behind a `OnceCell`, per-namespace dispatcher
//! families behind a keyed cache.

use cube_castle_sync_domain::event_bus::EventBusMetrics;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Process-wide metrics registry
pub struct MetricsRegistry {
    registry: Registry,
    event_bus: OnceCell<Arc<PrometheusEventBusMetrics>>,
    graph_sync: OnceCell<Arc<GraphSyncMetrics>>,
    dispatchers: Mutex<HashMap<String, Arc<DispatcherMetrics>>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            event_bus: OnceCell::new(),
            graph_sync: OnceCell::new(),
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the Prometheus registry for serving metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatcher metrics under `namespace`, registered on first use.
    pub fn dispatcher(&self, namespace: &str) -> Result<Arc<DispatcherMetrics>, prometheus::Error> {
        let mut dispatchers = self.dispatchers.lock();
        if let Some(existing) = dispatchers.get(namespace) {
            return Ok(existing.clone());
        }
        let metrics = Arc::new(DispatcherMetrics::register(&self.registry, namespace)?);
        dispatchers.insert(namespace.to_string(), metrics.clone());
        Ok(metrics)
    }

    pub fn event_bus(&self) -> Result<Arc<PrometheusEventBusMetrics>, prometheus::Error> {
        self.event_bus
            .get_or_try_init(|| PrometheusEventBusMetrics::register(&self.registry).map(Arc::new))
            .cloned()
    }

    pub fn graph_sync(&self) -> Result<Arc<GraphSyncMetrics>, prometheus::Error> {
        self.graph_sync
            .get_or_try_init(|| GraphSyncMetrics::register(&self.registry).map(Arc::new))
            .cloned()
    }

    /// Render every registered family in the text exposition format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Outbox dispatcher metrics
pub struct DispatcherMetrics {
    /// Rows published and marked
    pub success: IntCounter,
    /// Rows whose publish failed
    pub failure: IntCounter,
    /// Retries persisted with a new `available_at`
    pub retry_scheduled: IntCounter,
    /// Failures at or above the configured max retry
    pub escalated: IntCounter,
    /// 1 while a poll tick is running
    pub active: IntGauge,
    pub batch_duration: Histogram,
}

impl DispatcherMetrics {
    fn register(registry: &Registry, namespace: &str) -> Result<Self, prometheus::Error> {
        let success = IntCounter::with_opts(
            Opts::new("success_total", "Outbox rows published successfully").namespace(namespace),
        )?;
        registry.register(Box::new(success.clone()))?;

        let failure = IntCounter::with_opts(
            Opts::new("failure_total", "Outbox rows whose publish failed").namespace(namespace),
        )?;
        registry.register(Box::new(failure.clone()))?;

        let retry_scheduled = IntCounter::with_opts(
            Opts::new("retry_scheduled_total", "Outbox retries scheduled with backoff")
                .namespace(namespace),
        )?;
        registry.register(Box::new(retry_scheduled.clone()))?;

        let escalated = IntCounter::with_opts(
            Opts::new(
                "escalated_total",
                "Outbox failures at or above the max retry threshold",
            )
            .namespace(namespace),
        )?;
        registry.register(Box::new(escalated.clone()))?;

        let active = IntGauge::with_opts(
            Opts::new("active", "1 while a dispatch tick is in progress").namespace(namespace),
        )?;
        registry.register(Box::new(active.clone()))?;

        let batch_duration = Histogram::with_opts(
            HistogramOpts::new("batch_duration_seconds", "Dispatch batch duration in seconds")
                .namespace(namespace)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self {
            success,
            failure,
            retry_scheduled,
            escalated,
            active,
            batch_duration,
        })
    }
}

/// Event bus metrics, labelled by event type
pub struct PrometheusEventBusMetrics {
    pub published: IntCounterVec,
    pub no_handlers: IntCounterVec,
    pub handling_duration: HistogramVec,
}

impl PrometheusEventBusMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounterVec::new(
            Opts::new("event_bus_published_total", "Events published on the bus")
                .const_label("component", "event_bus"),
            &["event_type", "outcome"],
        )?;
        registry.register(Box::new(published.clone()))?;

        let no_handlers = IntCounterVec::new(
            Opts::new(
                "event_bus_no_handler_total",
                "Events published with no subscribed handler",
            )
            .const_label("component", "event_bus"),
            &["event_type"],
        )?;
        registry.register(Box::new(no_handlers.clone()))?;

        let handling_duration = HistogramVec::new(
            HistogramOpts::new(
                "event_bus_handling_duration_seconds",
                "Time spent running every handler of one publish call",
            )
            .const_label("component", "event_bus")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(handling_duration.clone()))?;

        Ok(Self {
            published,
            no_handlers,
            handling_duration,
        })
    }
}

impl EventBusMetrics for PrometheusEventBusMetrics {
    fn record_publish(&self, event_type: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.published
            .with_label_values(&[event_type, outcome])
            .inc();
        self.handling_duration
            .with_label_values(&[event_type])
            .observe(elapsed.as_secs_f64());
    }

    fn record_no_handlers(&self, event_type: &str) {
        self.no_handlers.with_label_values(&[event_type]).inc();
    }
}

/// CDC consumer metrics, labelled by consumer name
pub struct GraphSyncMetrics {
    pub events_consumed: IntCounterVec,
    pub consume_duration: HistogramVec,
    pub running_consumers: IntGauge,
}

impl GraphSyncMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let events_consumed = IntCounterVec::new(
            Opts::new("graph_sync_events_total", "Events handled by the CDC consumers")
                .const_label("component", "graph_sync"),
            &["consumer", "outcome"],
        )?;
        registry.register(Box::new(events_consumed.clone()))?;

        let consume_duration = HistogramVec::new(
            HistogramOpts::new(
                "graph_sync_consume_duration_seconds",
                "Time to apply one event to the graph, retries included",
            )
            .const_label("component", "graph_sync")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["consumer"],
        )?;
        registry.register(Box::new(consume_duration.clone()))?;

        let running_consumers = IntGauge::with_opts(
            Opts::new("graph_sync_running_consumers", "Consumers currently started")
                .const_label("component", "graph_sync"),
        )?;
        registry.register(Box::new(running_consumers.clone()))?;

        Ok(Self {
            events_consumed,
            consume_duration,
            running_consumers,
        })
    }

    pub fn record(&self, consumer: &str, outcome: &str, elapsed: Duration) {
        self.events_consumed
            .with_label_values(&[consumer, outcome])
            .inc();
        self.consume_duration
            .with_label_values(&[consumer])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_families_register_once() {
        let metrics = MetricsRegistry::new();
        let first = metrics.event_bus().unwrap();
        let second = metrics.event_bus().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let first = metrics.graph_sync().unwrap();
        let second = metrics.graph_sync().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_dispatcher_metrics_keyed_by_namespace() {
        let metrics = MetricsRegistry::new();
        let a = metrics.dispatcher("outbox_dispatch").unwrap();
        let again = metrics.dispatcher("outbox_dispatch").unwrap();
        let b = metrics.dispatcher("replica_two").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));

        a.success.inc();
        a.active.set(1);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("outbox_dispatch_success_total 1"));
        assert!(text.contains("outbox_dispatch_active 1"));
        assert!(text.contains("replica_two_retry_scheduled_total 0"));
    }

    #[test]
    fn test_event_bus_metrics_record_by_type() {
        let metrics = MetricsRegistry::new();
        let bus = metrics.event_bus().unwrap();
        bus.record_publish("employee.created", true, Duration::from_millis(3));
        bus.record_publish("employee.created", false, Duration::from_millis(3));
        bus.record_no_handlers("position.created");

        assert_eq!(
            bus.published
                .with_label_values(&["employee.created", "success"])
                .get(),
            1
        );
        assert_eq!(
            bus.no_handlers
                .with_label_values(&["position.created"])
                .get(),
            1
        );
    }
}
