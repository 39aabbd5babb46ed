pub mod config;
pub mod event_topics;

pub use event_topics::*;
