//! Domain layer of the cube-castle write/read consistency pipeline
//!
//! - `outbox`: outbox rows and the repository contract
//! - `events`: bus events and the decoder table
//! - `event_bus`: in-process publish/subscribe contract
//! - `graph_sync`: graph writes and the connection manager contract
//! - `consumer`: CDC consumer contract

pub mod consumer;
pub mod event_bus;
pub mod events;
pub mod graph_sync;
pub mod outbox;

pub use consumer::*;
pub use event_bus::*;
pub use events::*;
pub use outbox::*;
