//! PostgreSQL and in-memory implementations of the outbox repository

pub mod in_memory;
pub mod postgres;
pub mod postgres_tx;

pub use in_memory::InMemoryOutboxRepository;
pub use postgres::{PostgresOutboxRepository, PostgresOutboxTransaction};
