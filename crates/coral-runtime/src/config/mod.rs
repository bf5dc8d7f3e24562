//! Configuration for the Coral runtime.
//!
//! Defaults, then a `coral.toml` / `coral.yaml` file, then `CORAL_*`
//! environment variables, merged with figment and validated after extraction.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ENV_PREFIX, Profile, load_config, load_config_from_file};
pub use schema::{
    BusSection, CoralConfig, LogFormat, LogLevel, LogOutput, LoggingConfig, PluginsSection,
    SpanEventConfig,
};
pub use validation::validate_config;
