//! CDC consumer manager
//!
//! Registry of graph sync consumers keyed by event pattern. Routing prefers
//! a consumer registered for the exact event type, then the one registered
//! for `{aggregate}.*`. Events nobody consumes are ignored.
//!
//! Each consumption runs under the connection manager's retry policy. The
//! manager's own background task only watches health.

use crate::metrics::GraphSyncMetrics;
use cube_castle_shared::config::CdcConfig;
use cube_castle_shared::pattern_for;
use cube_castle_sync_domain::consumer::{
    ConsumeOutcome, ConsumerError, ConsumerStats, EventConsumer,
};
use cube_castle_sync_domain::events::DomainEvent;
use cube_castle_sync_domain::graph_sync::{ConnectionManager, ConnectionManagerExt};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health of the graph store and of every registered consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerHealth {
    pub graph_error: Option<String>,
    /// Consumer name to failure reason
    pub unhealthy_consumers: BTreeMap<String, String>,
}

impl ManagerHealth {
    pub fn is_healthy(&self) -> bool {
        self.graph_error.is_none() && self.unhealthy_consumers.is_empty()
    }
}

struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CdcConsumerManager {
    consumers: DashMap<String, Arc<dyn EventConsumer>>,
    connection: Arc<dyn ConnectionManager>,
    config: CdcConfig,
    metrics: Option<Arc<GraphSyncMetrics>>,
    /// Interrupts retry backoff of in-flight consumptions
    shutdown: CancellationToken,
    task: Mutex<Option<HealthTask>>,
}

fn validate_pattern(pattern: &str) -> Result<(), ConsumerError> {
    let valid = match pattern.strip_suffix(".*") {
        Some(aggregate) => !aggregate.is_empty() && !aggregate.contains('.'),
        None => pattern_for(pattern).is_some() && !pattern.contains('*'),
    };
    if valid {
        Ok(())
    } else {
        Err(ConsumerError::InvalidPattern(pattern.to_string()))
    }
}

impl CdcConsumerManager {
    pub fn new(connection: Arc<dyn ConnectionManager>, config: CdcConfig) -> Self {
        Self {
            consumers: DashMap::new(),
            connection,
            config,
            metrics: None,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GraphSyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind retry cancellation to `shutdown`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    pub fn register(&self, consumer: Arc<dyn EventConsumer>) -> Result<(), ConsumerError> {
        let pattern = consumer.event_pattern().to_string();
        validate_pattern(&pattern)?;
        match self.consumers.entry(pattern) {
            Entry::Occupied(entry) => Err(ConsumerError::DuplicateConsumer(entry.key().clone())),
            Entry::Vacant(entry) => {
                info!(consumer = consumer.name(), pattern = %entry.key(), "Consumer registered");
                entry.insert(consumer);
                Ok(())
            }
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Consumer responsible for `event_type`, if any
    pub fn consumer_for(&self, event_type: &str) -> Option<Arc<dyn EventConsumer>> {
        if let Some(exact) = self.consumers.get(event_type) {
            return Some(exact.value().clone());
        }
        let pattern = pattern_for(event_type)?;
        self.consumers.get(&pattern).map(|c| c.value().clone())
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.consumer_for(event_type).is_some()
    }

    /// Route one event to its consumer, retrying transient graph failures.
    pub async fn consume_event(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError> {
        let Some(consumer) = self.consumer_for(&event.event_type) else {
            debug!(event_type = %event.event_type, "No consumer registered, event ignored");
            return Ok(ConsumeOutcome::Ignored);
        };

        let started = Instant::now();
        let result = self
            .connection
            .execute_with_retry(&self.shutdown, |_| consumer.consume(event))
            .await
            .map_err(ConsumerError::from);

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(ConsumeOutcome::Applied) => "applied",
                Ok(ConsumeOutcome::Ignored) => "ignored",
                Err(_) => "failed",
            };
            metrics.record(consumer.name(), outcome, started.elapsed());
        }
        if let Err(e) = &result {
            if self.shutdown.is_cancelled() {
                debug!(
                    consumer = consumer.name(),
                    event_id = %event.event_id,
                    error = %e,
                    "Graph sync interrupted by shutdown"
                );
                return result;
            }
            error!(
                consumer = consumer.name(),
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Graph sync failed"
            );
        }
        result
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventConsumer>> {
        self.consumers.iter().map(|c| c.value().clone()).collect()
    }

    /// Start every consumer and the health-check ticker.
    pub async fn start_all(&self, parent: &CancellationToken) -> Result<(), ConsumerError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(ConsumerError::AlreadyRunning);
        }

        let consumers = self.snapshot();
        for consumer in &consumers {
            consumer.start().await?;
        }
        if let Some(metrics) = &self.metrics {
            metrics.running_consumers.set(consumers.len() as i64);
        }

        let cancel = parent.child_token();
        let token = cancel.clone();
        let connection = self.connection.clone();
        let period = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            health_loop(token, connection, consumers, period).await;
        });
        *task = Some(HealthTask { cancel, handle });

        info!(consumers = self.consumers.len(), "🚀 CDC consumer manager started");
        Ok(())
    }

    /// Stop the health ticker, wait for it to exit, then stop every consumer.
    pub async fn stop_all(&self) -> Result<(), ConsumerError> {
        let mut task = self.task.lock().await;
        let running = task.take().ok_or(ConsumerError::NotRunning)?;
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Health-check task ended abnormally");
        }

        for consumer in self.snapshot() {
            if let Err(e) = consumer.stop().await {
                warn!(consumer = consumer.name(), error = %e, "Consumer failed to stop");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.running_consumers.set(0);
        }
        info!("🛑 CDC consumer manager stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn health(&self) -> ManagerHealth {
        check_health(self.connection.as_ref(), &self.snapshot()).await
    }

    /// Per-consumer counters, sorted by name
    pub fn statistics(&self) -> Vec<ConsumerStats> {
        let mut stats: Vec<ConsumerStats> = self.consumers.iter().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

async fn check_health(
    connection: &dyn ConnectionManager,
    consumers: &[Arc<dyn EventConsumer>],
) -> ManagerHealth {
    let mut health = ManagerHealth {
        graph_error: connection.health_check().await.err().map(|e| e.to_string()),
        ..ManagerHealth::default()
    };
    for consumer in consumers {
        if let Err(e) = consumer.health().await {
            health
                .unhealthy_consumers
                .insert(consumer.name().to_string(), e.to_string());
        }
    }
    health
}

async fn health_loop(
    cancel: CancellationToken,
    connection: Arc<dyn ConnectionManager>,
    consumers: Vec<Arc<dyn EventConsumer>>,
    period: std::time::Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let health = check_health(connection.as_ref(), &consumers).await;
                if health.is_healthy() {
                    debug!("CDC health check passed");
                } else {
                    warn!(
                        graph_error = ?health.graph_error,
                        unhealthy = ?health.unhealthy_consumers,
                        "⚠️ CDC health check failed"
                    );
                }
            }
        }
    }
    debug!("CDC health loop exited");
}
