//! # strata-core
//!
//! Shared foundation for the strata crates: environment-driven configuration
//! with validation, and structured logging setup.

pub mod config;
pub mod logging;

pub use config::{AppConfig, ConfigError, DatabaseConfig, Environment, MigrationSettings, TlsMode};
pub use logging::{init_logging, LogFormat, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get crate version
pub fn version() -> &'static str {
    VERSION
}
