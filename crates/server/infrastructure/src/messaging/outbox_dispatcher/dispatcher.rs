//! OutboxDispatcher - polling relay from the outbox table to the event bus
//!
//! ```text
//!   interval tick ──▶ BEGIN
//!                     SELECT ... FOR UPDATE SKIP LOCKED (batch_size)
//!                     for each row, in order:
//!                        decode ─▶ EventBus::publish
//!                          ok   ─▶ mark_published
//!                          err  ─▶ increment_retry(now + backoff)
//!                     COMMIT
//! ```
//!
//! Delivery is at-least-once: a crash between publish and commit
//! redelivers the row on the next tick.

use crate::messaging::backoff::DispatchBackoff;
use crate::metrics::{DispatcherMetrics, MetricsRegistry};
use chrono::Utc;
use cube_castle_shared::config::DispatcherConfig;
use cube_castle_sync_domain::event_bus::{EventBus, EventBusError};
use cube_castle_sync_domain::events::{DecodeError, EventDecoderRegistry};
use cube_castle_sync_domain::outbox::{
    OutboxError, OutboxEvent, OutboxRepository, OutboxTransaction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Outbox dispatcher is already running")]
    AlreadyRunning,

    #[error("Outbox dispatcher is not running")]
    NotRunning,

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Dispatcher task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why one row could not be delivered
#[derive(Debug, Error)]
enum DeliveryError {
    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Publish(#[from] EventBusError),
}

/// Result of one dispatch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub retries_scheduled: usize,
    pub escalated: usize,
    /// Row-level store errors (mark or retry bookkeeping failed)
    pub store_errors: usize,
    /// Batch fetch failed; nothing was processed
    pub fetch_failed: bool,
    /// Cancellation stopped the batch before every row was processed
    pub cancelled: bool,
    pub committed: bool,
}

impl DispatchReport {
    pub fn processed(&self) -> usize {
        self.published + self.failed
    }
}

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatus {
    pub running: bool,
    pub cycles: u64,
    pub published_total: u64,
    pub failed_total: u64,
    pub escalated_total: u64,
}

#[derive(Default)]
struct Totals {
    cycles: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
}

impl Totals {
    fn add(&self, report: &DispatchReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.published
            .fetch_add(report.published as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.escalated
            .fetch_add(report.escalated as u64, Ordering::Relaxed);
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct DispatcherCore {
    repository: Arc<dyn OutboxRepository>,
    event_bus: Arc<dyn EventBus>,
    decoders: Arc<EventDecoderRegistry>,
    config: DispatcherConfig,
    backoff: DispatchBackoff,
    metrics: Arc<DispatcherMetrics>,
    totals: Totals,
}

/// Outbox Dispatcher Service
///
/// Owns one background polling task between `start` and `stop`.
pub struct OutboxDispatcher {
    core: Arc<DispatcherCore>,
    task: Mutex<Option<RunningTask>>,
}

impl OutboxDispatcher {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        event_bus: Arc<dyn EventBus>,
        decoders: Arc<EventDecoderRegistry>,
        config: DispatcherConfig,
        metrics: &MetricsRegistry,
    ) -> Result<Self, DispatcherError> {
        let metrics = metrics.dispatcher(&config.metric_namespace)?;
        Ok(Self {
            core: Arc::new(DispatcherCore {
                repository,
                event_bus,
                decoders,
                backoff: DispatchBackoff::from_config(&config),
                config,
                metrics,
                totals: Totals::default(),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core.config
    }

    /// Spawn the polling task, bound to a child of `parent`.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), DispatcherError> {
        let mut task = self.task.lock().await;
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                return Err(DispatcherError::AlreadyRunning);
            }
            debug!("Previous dispatcher task already exited, restarting");
        }

        let cancel = parent.child_token();
        let core = self.core.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { core.poll_loop(token).await });
        *task = Some(RunningTask { cancel, handle });

        info!(
            poll_interval_ms = self.core.config.poll_interval.as_millis() as u64,
            batch_size = self.core.config.batch_size,
            namespace = %self.core.config.metric_namespace,
            "🚀 Outbox dispatcher started"
        );
        Ok(())
    }

    /// Cancel the polling task and wait for it to exit.
    pub async fn stop(&self) -> Result<(), DispatcherError> {
        let mut task = self.task.lock().await;
        let running = task.take().ok_or(DispatcherError::NotRunning)?;

        running.cancel.cancel();
        let joined = running.handle.await;
        self.core.metrics.active.set(0);
        joined?;

        info!("🛑 Outbox dispatcher stopped");
        Ok(())
    }

    pub async fn status(&self) -> DispatcherStatus {
        let totals = &self.core.totals;
        DispatcherStatus {
            running: self.is_running().await,
            cycles: totals.cycles.load(Ordering::Relaxed),
            published_total: totals.published.load(Ordering::Relaxed),
            failed_total: totals.failed.load(Ordering::Relaxed),
            escalated_total: totals.escalated.load(Ordering::Relaxed),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Run a single dispatch cycle in the caller's task.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> DispatchReport {
        self.core.run_cycle(cancel).await
    }
}

impl DispatcherCore {
    async fn poll_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_cycle(&cancel).await;
                    if report.fetched > 0 {
                        info!(
                            fetched = report.fetched,
                            published = report.published,
                            failed = report.failed,
                            retries_scheduled = report.retries_scheduled,
                            "📦 Dispatch cycle completed"
                        );
                    }
                }
            }
        }

        self.metrics.active.set(0);
        debug!("Outbox dispatcher loop exited");
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> DispatchReport {
        self.metrics.active.set(1);
        let timer = self.metrics.batch_duration.start_timer();
        let report = self.dispatch_batch(cancel).await;
        timer.observe_duration();
        self.totals.add(&report);
        self.metrics.active.set(0);
        report
    }

    async fn dispatch_batch(&self, cancel: &CancellationToken) -> DispatchReport {
        let mut report = DispatchReport::default();
        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let mut tx = match self.repository.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "Failed to open outbox transaction, skipping batch");
                report.fetch_failed = true;
                return report;
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => None,
            rows = tx.fetch_unpublished_for_update(self.config.batch_size) => Some(rows),
        };

        let rows = match fetched {
            None => {
                debug!("Shutdown during batch fetch");
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback after cancelled fetch failed");
                }
                report.cancelled = true;
                return report;
            }
            Some(Err(e)) => {
                error!(error = %e, "Failed to fetch outbox batch, skipping until next tick");
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback after failed fetch failed");
                }
                report.fetch_failed = true;
                return report;
            }
            Some(Ok(rows)) => rows,
        };

        report.fetched = rows.len();
        if rows.is_empty() {
            if let Err(e) = tx.commit().await {
                warn!(error = %e, "Failed to close empty outbox transaction");
            }
            return report;
        }

        for row in &rows {
            if cancel.is_cancelled() {
                info!(
                    remaining = report.fetched - report.processed(),
                    "Dispatch cancelled mid-batch"
                );
                report.cancelled = true;
                break;
            }

            match self.deliver(row).await {
                Ok(()) => match tx.mark_published(row.event_id).await {
                    Ok(()) => {
                        report.published += 1;
                        self.metrics.success.inc();
                        debug!(
                            event_id = %row.event_id,
                            event_type = %row.event_type,
                            "Outbox event published"
                        );
                    }
                    Err(e) => {
                        report.store_errors += 1;
                        error!(
                            event_id = %row.event_id,
                            error = %e,
                            "Event delivered but could not be marked published"
                        );
                    }
                },
                Err(failure) if cancel.is_cancelled() => {
                    // Shutdown interrupted delivery; the row is left untouched
                    debug!(
                        event_id = %row.event_id,
                        error = %failure,
                        "Delivery interrupted by shutdown"
                    );
                    report.cancelled = true;
                    break;
                }
                Err(failure) => {
                    report.failed += 1;
                    self.metrics.failure.inc();
                    self.schedule_retry(tx.as_mut(), row, &failure, &mut report)
                        .await;
                }
            }
        }

        match tx.commit().await {
            Ok(()) => report.committed = true,
            Err(e) => error!(
                error = %e,
                processed = report.processed(),
                "Failed to commit outbox batch, rows will be redelivered"
            ),
        }
        report
    }

    async fn deliver(&self, row: &OutboxEvent) -> Result<(), DeliveryError> {
        let event = self.decoders.decode_row(row)?;
        self.event_bus.publish(&event).await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        tx: &mut dyn OutboxTransaction,
        row: &OutboxEvent,
        failure: &DeliveryError,
        report: &mut DispatchReport,
    ) {
        let next_available_at = self.backoff.next_available_at(row.retry_count, Utc::now());

        if let Err(e) = tx.increment_retry(row.event_id, next_available_at).await {
            report.store_errors += 1;
            error!(
                event_id = %row.event_id,
                error = %e,
                "Failed to schedule outbox retry"
            );
            return;
        }

        report.retries_scheduled += 1;
        self.metrics.retry_scheduled.inc();
        let retry_count = row.retry_count + 1;

        if self.backoff.is_escalation(retry_count) {
            report.escalated += 1;
            self.metrics.escalated.inc();
            error!(
                event_id = %row.event_id,
                event_type = %row.event_type,
                aggregate_id = %row.aggregate_id,
                retry_count,
                max_retry = self.config.max_retry,
                next_available_at = %next_available_at,
                error = %failure,
                "🚨 Outbox event exceeded max retry, still retrying"
            );
        } else {
            warn!(
                event_id = %row.event_id,
                event_type = %row.event_type,
                retry_count,
                next_available_at = %next_available_at,
                error = %failure,
                "Outbox event delivery failed, retry scheduled"
            );
        }
    }
}
