//! Messaging infrastructure
//!
//! In-process event bus and the outbox dispatcher that feeds it.

pub mod backoff;
pub mod event_bus;
pub mod outbox_dispatcher;

pub use backoff::{DispatchBackoff, MAX_BACKOFF};
pub use event_bus::InProcessEventBus;
pub use outbox_dispatcher::{DispatchReport, DispatcherError, DispatcherStatus, OutboxDispatcher};
