//! # Lattice Runtime Configuration
//!
//! Configuration and logging bootstrap shared by every Lattice node.
//!
//! ## Features
//!
//! - **Runtime Configuration**: scheduler sizing, middleman transport options
//! - **Layered Loading**: defaults, TOML file, `LATTICE_` environment overrides
//! - **Logging**: `tracing-subscriber` setup, plain or JSON
//!
//! ## Usage
//!
//! ```rust
//! use lattice_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default();
//! assert!(config.validate().is_ok());
//! lattice_config::logging::init(&config.logging);
//! ```

pub mod logging;
pub mod runtime_config;

pub use runtime_config::{
    LoggingConfig, MiddlemanConfig, RuntimeConfig, SchedulerConfig, ENV_PREFIX, ENV_SEPARATOR,
};
