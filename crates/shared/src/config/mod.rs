//! Configuration module for the cube-castle sync pipeline
//!
//! Centralized configuration loading, validation and DTOs for the outbox
//! dispatcher, the graph connection manager and the CDC consumers.
//!
//! # Principles
//!
//! 1. **Single Source of Truth**: configuration is loaded once at startup
//! 2. **Fail Fast**: malformed values are errors, never silent fallbacks
//! 3. **DTO Pattern**: configuration is immutable and passed to constructors
//!
//! # Usage
//!
//! ```ignore
//! use cube_castle_shared::config::ConfigLoader;
//!
//! let loader = ConfigLoader::new(None);
//! let config = loader.load_pipeline_config()?;
//! println!("polling every {:?}", config.dispatcher.poll_interval);
//! ```

pub mod dto;
pub mod error;
pub mod loader;
pub mod validator;

pub use dto::{
    CdcConfig, DatabaseConfig, DispatcherConfig, GraphConfig, GraphMode, PipelineConfigDto,
};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, parse_duration};
pub use validator::{
    validate_database_url, validate_dispatcher_config, validate_graph_config,
    validate_metric_namespace, validate_pipeline_config,
};
