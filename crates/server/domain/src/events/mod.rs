//! Domain events carried from the outbox to the graph consumers

pub mod decoder;
pub mod envelope;
pub mod payload;

pub use decoder::{DecodeError, DecodeFn, EventDecoderRegistry, outbox_event_from};
pub use envelope::{DomainEvent, EventMetadata};
pub use payload::*;
