//! Mock connection manager over [`MemoryGraph`]
//!
//! Write transactions serialize on the graph lock and work on a staged
//! copy, published on commit. Failures can be scripted per `begin` call or
//! injected at random through [`MockGraphOptions`].

use super::memory::MemoryGraph;
use async_trait::async_trait;
use chrono::Utc;
use cube_castle_shared::config::GraphConfig;
use cube_castle_sync_domain::graph_sync::{
    AccessMode, ConnectionKind, ConnectionManager, Direction, GraphError, GraphMutation,
    GraphTransaction, MutationOutcome, Neighbor, NodeRef, OperationStats, Properties, RetryPolicy,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct MockGraphOptions {
    /// Probability in `[0, 1]` that `begin` succeeds
    pub success_rate: f64,
    /// Simulated latency drawn uniformly from this range on each `begin`
    pub latency: Option<Range<Duration>>,
}

impl Default for MockGraphOptions {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            latency: None,
        }
    }
}

pub struct MockConnectionManager {
    graph: Arc<AsyncMutex<MemoryGraph>>,
    options: MockGraphOptions,
    scripted_failures: Mutex<VecDeque<GraphError>>,
    retry_policy: RetryPolicy,
    stats: OperationStats,
    closed: AtomicBool,
}

impl Default for MockConnectionManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MockConnectionManager {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self::with_options(retry_policy, MockGraphOptions::default())
    }

    pub fn with_options(retry_policy: RetryPolicy, options: MockGraphOptions) -> Self {
        Self {
            graph: Arc::new(AsyncMutex::new(MemoryGraph::new())),
            options,
            scripted_failures: Mutex::new(VecDeque::new()),
            retry_policy,
            stats: OperationStats::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self::new(RetryPolicy::from_config(config))
    }

    /// Make the next `begin` calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = GraphError>) {
        self.scripted_failures.lock().extend(errors);
    }

    /// Copy of the committed graph
    pub async fn snapshot(&self) -> MemoryGraph {
        self.graph.lock().await.clone()
    }

    async fn simulate(&self) -> Result<(), GraphError> {
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            debug!(error = %error, "Scripted graph failure");
            return Err(error);
        }

        let (latency, fails) = {
            let mut rng = rand::thread_rng();
            let latency = self
                .options
                .latency
                .clone()
                .filter(|range| !range.is_empty())
                .map(|range| rng.gen_range(range));
            (latency, rng.gen_bool(1.0 - self.options.success_rate.clamp(0.0, 1.0)))
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fails {
            return Err(GraphError::Unavailable("simulated mock failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Mock
    }

    async fn begin(&self, mode: AccessMode) -> Result<Box<dyn GraphTransaction>, GraphError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed);
        }
        self.simulate().await?;

        let tx = match mode {
            AccessMode::Write => {
                let guard = self.graph.clone().lock_owned().await;
                MockTransaction {
                    staged: guard.clone(),
                    guard: Some(guard),
                }
            }
            AccessMode::Read => MockTransaction {
                staged: self.graph.lock().await.clone(),
                guard: None,
            },
        };
        Ok(Box::new(tx))
    }

    async fn health_check(&self) -> Result<(), GraphError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed);
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn stats(&self) -> &OperationStats {
        &self.stats
    }

    async fn close(&self) -> Result<(), GraphError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Mock graph connection manager closed");
        }
        Ok(())
    }
}

/// Write transactions hold the graph lock until commit or drop; read
/// transactions work on a detached snapshot.
struct MockTransaction {
    staged: MemoryGraph,
    guard: Option<OwnedMutexGuard<MemoryGraph>>,
}

#[async_trait]
impl GraphTransaction for MockTransaction {
    async fn apply(&mut self, mutation: &GraphMutation) -> Result<MutationOutcome, GraphError> {
        if self.guard.is_none() {
            return Err(GraphError::Transaction(
                "write attempted in a read transaction".to_string(),
            ));
        }
        self.staged.apply(mutation, Utc::now())
    }

    async fn find_node(&mut self, node: &NodeRef) -> Result<Option<Properties>, GraphError> {
        Ok(self.staged.find_node(node))
    }

    async fn count_nodes(&mut self, label: &str) -> Result<u64, GraphError> {
        Ok(self.staged.count_nodes(label))
    }

    async fn neighbors(
        &mut self,
        node: &NodeRef,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Neighbor>, GraphError> {
        Ok(self.staged.neighbors(node, rel_type, direction))
    }

    async fn commit(self: Box<Self>) -> Result<(), GraphError> {
        let MockTransaction { staged, guard } = *self;
        if let Some(mut guard) = guard {
            *guard = staged;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GraphError> {
        Ok(())
    }
}
