// Persistence Layer - outbox repositories and the PostgreSQL pool

pub mod outbox;
pub mod pool;

pub use outbox::{InMemoryOutboxRepository, PostgresOutboxRepository, PostgresOutboxTransaction};
pub use pool::connect_pool;
