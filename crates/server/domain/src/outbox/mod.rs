//! Transactional Outbox Pattern
//!
//! Domain-level abstractions for the outbox table, which removes the
//! dual-write problem between the relational store and the event bus.

pub mod model;
pub mod repository;

pub use model::{NewOutboxEvent, OutboxError, OutboxEvent};
pub use repository::{OutboxRepository, OutboxRepositoryTx, OutboxStats, OutboxTransaction};
