//! Infrastructure layer of the cube-castle sync pipeline
//!
//! Concrete implementations of the domain contracts, grouped by technology:
//! - `persistence`: PostgreSQL and in-memory outbox repositories
//! - `messaging`: in-process event bus and the outbox dispatcher
//! - `graph`: Neo4j HTTP and in-memory graph connection managers
//! - `cdc`: graph sync consumers, consumer manager and bus bridge
//! - `metrics`: Prometheus metric families

pub mod cdc;
pub mod graph;
pub mod messaging;
pub mod metrics;
pub mod persistence;

pub use cdc::{CdcConsumerManager, CdcSyncService, EmployeeGraphConsumer, OrganizationGraphConsumer};
pub use graph::{HttpConnectionManager, MockConnectionManager, create_connection_manager};
pub use messaging::{InProcessEventBus, OutboxDispatcher};
pub use metrics::MetricsRegistry;
pub use persistence::{InMemoryOutboxRepository, PostgresOutboxRepository, connect_pool};
