//! Connection manager contract of the secondary graph store
//!
//! Backends implement [`ConnectionManager`] (begin a transaction, health,
//! lifecycle). Units of work run through [`ConnectionManagerExt`], which
//! owns commit/rollback, statistics and retries for every backend.

use super::error::{GraphError, Retryable};
use super::mutation::{Direction, GraphMutation, MutationOutcome, Neighbor};
use super::operation::{NodeRef, Properties};
use super::retry::{RetryError, RetryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    Mock,
    Http,
}

/// An open graph transaction
///
/// Dropping the handle without `commit` discards its writes.
#[async_trait]
pub trait GraphTransaction: Send {
    async fn apply(&mut self, mutation: &GraphMutation) -> Result<MutationOutcome, GraphError>;

    async fn find_node(&mut self, node: &NodeRef) -> Result<Option<Properties>, GraphError>;

    async fn count_nodes(&mut self, label: &str) -> Result<u64, GraphError>;

    /// Nodes reachable through one `rel_type` relationship, retired
    /// relationships included.
    async fn neighbors(
        &mut self,
        node: &NodeRef,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Neighbor>, GraphError>;

    async fn commit(self: Box<Self>) -> Result<(), GraphError>;

    async fn rollback(self: Box<Self>) -> Result<(), GraphError>;
}

/// Arbitrary work executed inside one graph transaction
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut dyn GraphTransaction) -> Result<Self::Output, GraphError>;
}

/// Ordered mutations applied in one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationBatch {
    mutations: Vec<GraphMutation>,
}

impl MutationBatch {
    pub fn new(mutations: Vec<GraphMutation>) -> Self {
        Self { mutations }
    }

    pub fn push(&mut self, mutation: GraphMutation) {
        self.mutations.push(mutation);
    }

    pub fn mutations(&self) -> &[GraphMutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        self.mutations.iter().try_for_each(GraphMutation::validate)
    }
}

#[async_trait]
impl UnitOfWork for MutationBatch {
    type Output = Vec<MutationOutcome>;

    async fn run(&self, tx: &mut dyn GraphTransaction) -> Result<Self::Output, GraphError> {
        self.validate()?;
        let mut outcomes = Vec::with_capacity(self.mutations.len());
        for mutation in &self.mutations {
            outcomes.push(tx.apply(mutation).await?);
        }
        Ok(outcomes)
    }
}

/// Snapshot of a connection manager's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatistics {
    pub kind: ConnectionKind,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub retried_operations: u64,
    pub average_latency: Duration,
    pub last_error: Option<String>,
}

impl ConnectionStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            1.0
        } else {
            self.successful_operations as f64 / self.total_operations as f64
        }
    }
}

/// Counters shared by every backend
#[derive(Debug, Default)]
pub struct OperationStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    latency_micros: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl OperationStats {
    pub fn record(&self, elapsed: Duration, error: Option<&GraphError>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match error {
            None => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Some(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, kind: ConnectionKind) -> ConnectionStatistics {
        let total = self.total.load(Ordering::Relaxed);
        let average_latency = match total {
            0 => Duration::ZERO,
            n => Duration::from_micros(self.latency_micros.load(Ordering::Relaxed) / n),
        };
        ConnectionStatistics {
            kind,
            total_operations: total,
            successful_operations: self.succeeded.load(Ordering::Relaxed),
            failed_operations: self.failed.load(Ordering::Relaxed),
            retried_operations: self.retried.load(Ordering::Relaxed),
            average_latency,
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Owner of the connections to the graph store
///
/// The underlying pool or client is private to the implementation.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    async fn begin(&self, mode: AccessMode) -> Result<Box<dyn GraphTransaction>, GraphError>;

    async fn health_check(&self) -> Result<(), GraphError>;

    fn retry_policy(&self) -> RetryPolicy;

    fn stats(&self) -> &OperationStats;

    fn statistics(&self) -> ConnectionStatistics {
        self.stats().snapshot(self.kind())
    }

    /// Release connections. Further `begin` calls fail with
    /// [`GraphError::Closed`].
    async fn close(&self) -> Result<(), GraphError>;
}

/// Transaction and retry helpers available on every [`ConnectionManager`]
#[async_trait]
pub trait ConnectionManagerExt: ConnectionManager {
    /// Run `work` in a write transaction; commit on success, roll back on
    /// error.
    async fn execute_write<W>(&self, work: &W) -> Result<W::Output, GraphError>
    where
        W: UnitOfWork + ?Sized,
    {
        execute(self, AccessMode::Write, work).await
    }

    async fn execute_read<W>(&self, work: &W) -> Result<W::Output, GraphError>
    where
        W: UnitOfWork + ?Sized,
    {
        execute(self, AccessMode::Read, work).await
    }

    /// Run `op` under this manager's [`RetryPolicy`].
    async fn execute_with_retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        T: Send,
        E: Retryable + std::error::Error + Send + 'static,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        let stats = self.stats();
        self.retry_policy()
            .run(cancel, |attempt| {
                if attempt > 1 {
                    stats.record_retry();
                }
                op(attempt)
            })
            .await
    }
}

impl<M: ConnectionManager + ?Sized> ConnectionManagerExt for M {}

async fn execute<M, W>(manager: &M, mode: AccessMode, work: &W) -> Result<W::Output, GraphError>
where
    M: ConnectionManager + ?Sized,
    W: UnitOfWork + ?Sized,
{
    let started = Instant::now();
    let result = run_in_transaction(manager, mode, work).await;
    manager
        .stats()
        .record(started.elapsed(), result.as_ref().err());
    result
}

async fn run_in_transaction<M, W>(
    manager: &M,
    mode: AccessMode,
    work: &W,
) -> Result<W::Output, GraphError>
where
    M: ConnectionManager + ?Sized,
    W: UnitOfWork + ?Sized,
{
    let mut tx = manager.begin(mode).await?;
    match work.run(tx.as_mut()).await {
        Ok(output) => {
            tx.commit().await?;
            Ok(output)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    mode = %mode,
                    error = %rollback_err,
                    "Rollback failed after unit of work error"
                );
            }
            Err(e)
        }
    }
}
