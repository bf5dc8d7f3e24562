//! Coral Runtime - configuration, logging and process orchestration.
//!
//! This crate provides:
//! - Layered configuration (`CoralConfig`, `ConfigLoader`): defaults, then
//!   `coral.toml` / `coral.yaml`, then `CORAL_*` environment variables
//! - Logging initialisation over `tracing-subscriber`
//! - `CoralRuntime`: builds the engine from configuration, installs linked
//!   plugins, and runs until a shutdown signal
//!
//! ```ignore
//! use coral_runtime::CoralRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CoralRuntime::builder().build()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, CoralConfig, LoggingConfig, Profile};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{CoralRuntime, LogSink, RuntimeBuilder, RuntimeStats};

// Re-export tracing for use by plugin crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for plugin code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
