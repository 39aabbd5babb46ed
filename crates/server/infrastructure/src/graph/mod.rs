//! Secondary graph store backends

pub mod cypher;
pub mod factory;
pub mod http;
pub mod memory;
pub mod mock;

pub use factory::create_connection_manager;
pub use http::HttpConnectionManager;
pub use memory::MemoryGraph;
pub use mock::{MockConnectionManager, MockGraphOptions};
