//! Graph synchronization model
//!
//! Store-independent description of the writes that keep the secondary
//! graph store in step with the relational store, and the contract of the
//! connection manager that executes them.

pub mod connection;
pub mod error;
pub mod mutation;
pub mod operation;
pub mod queries;
pub mod retry;

pub use connection::{
    AccessMode, ConnectionKind, ConnectionManager, ConnectionManagerExt, ConnectionStatistics,
    GraphTransaction, MutationBatch, OperationStats, UnitOfWork,
};
pub use error::{GraphError, Retryable};
pub use mutation::{AuditRecord, Direction, GraphMutation, MutationOutcome, Neighbor};
pub use operation::{
    EventStamp, NodeRef, NodeSyncOperation, Properties, PropertyValue, SyncOperationKind,
    is_identifier,
};
pub use queries::{CountNodes, FindNeighbors, FindNode};
pub use retry::{RetryError, RetryPolicy};
