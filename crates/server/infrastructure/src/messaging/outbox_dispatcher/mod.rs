//! Outbox Dispatcher Implementation
//!
//! Background process that moves committed outbox rows onto the in-process
//! event bus, with exponential backoff for rows whose delivery fails.

pub mod dispatcher;

pub use dispatcher::{DispatchReport, DispatcherError, DispatcherStatus, OutboxDispatcher};
