//! CDC sync service
//!
//! Bridges the event bus to the [`CdcConsumerManager`]: one bus handler per
//! event type the manager routes. Also replays batches of events with a
//! bounded number of in-flight consumptions.

use super::manager::CdcConsumerManager;
use async_trait::async_trait;
use cube_castle_shared::config::CdcConfig;
use cube_castle_sync_domain::consumer::{ConsumeOutcome, ConsumerError};
use cube_castle_sync_domain::event_bus::{EventBus, EventBusError, EventHandler, HandlerError};
use cube_castle_sync_domain::events::DomainEvent;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatistics {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_latency: Duration,
}

/// Outcome of a bulk replay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub total: usize,
    pub applied: usize,
    pub ignored: usize,
    /// Event id and error of every failed event
    pub failures: Vec<(Uuid, String)>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    latency_micros: AtomicU64,
}

pub struct CdcSyncService {
    manager: Arc<CdcConsumerManager>,
    replay_permits: Arc<Semaphore>,
    counters: Counters,
}

impl CdcSyncService {
    pub fn new(manager: Arc<CdcConsumerManager>, config: &CdcConfig) -> Self {
        Self {
            manager,
            replay_permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            counters: Counters::default(),
        }
    }

    pub fn manager(&self) -> &Arc<CdcConsumerManager> {
        &self.manager
    }

    /// Subscribe this service for every type in `event_types` that the
    /// manager routes. Returns the number of subscriptions made.
    pub fn subscribe(
        self: &Arc<Self>,
        bus: &dyn EventBus,
        event_types: &[&str],
    ) -> Result<usize, EventBusError> {
        let mut subscribed = 0;
        for event_type in event_types {
            if !self.manager.handles(event_type) {
                debug!(event_type, "No consumer routes this type, not subscribing");
                continue;
            }
            bus.subscribe(event_type, self.clone())?;
            subscribed += 1;
        }
        info!(subscribed, "📡 CDC sync service subscribed to the event bus");
        Ok(subscribed)
    }

    pub async fn sync_event(&self, event: &DomainEvent) -> Result<ConsumeOutcome, ConsumerError> {
        let started = Instant::now();
        let result = self.manager.consume_event(event).await;

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        let counter = if result.is_ok() {
            &self.counters.succeeded
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Consume `events` with at most `max_concurrency` in flight.
    ///
    /// Completion order is unspecified; per-node event stamps keep the
    /// result independent of it.
    pub async fn replay(self: &Arc<Self>, events: Vec<DomainEvent>) -> ReplayReport {
        let mut report = ReplayReport {
            total: events.len(),
            ..ReplayReport::default()
        };
        let mut tasks = JoinSet::new();

        for event in events {
            let Ok(permit) = self.replay_permits.clone().acquire_owned().await else {
                report
                    .failures
                    .push((event.event_id, "replay semaphore closed".to_string()));
                continue;
            };
            let service = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = service.sync_event(&event).await;
                (event.event_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(ConsumeOutcome::Applied))) => report.applied += 1,
                Ok((_, Ok(ConsumeOutcome::Ignored))) => report.ignored += 1,
                Ok((event_id, Err(e))) => report.failures.push((event_id, e.to_string())),
                Err(e) => report.failures.push((Uuid::nil(), e.to_string())),
            }
        }

        if report.failures.is_empty() {
            info!(total = report.total, applied = report.applied, "CDC replay completed");
        } else {
            warn!(
                total = report.total,
                failed = report.failures.len(),
                "CDC replay completed with failures"
            );
        }
        report
    }

    pub fn statistics(&self) -> SyncStatistics {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let average_latency = match processed {
            0 => Duration::ZERO,
            n => Duration::from_micros(self.counters.latency_micros.load(Ordering::Relaxed) / n),
        };
        SyncStatistics {
            processed,
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            average_latency,
        }
    }
}

#[async_trait]
impl EventHandler for CdcSyncService {
    fn name(&self) -> &str {
        "cdc-sync"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        self.sync_event(event).await?;
        Ok(())
    }
}
