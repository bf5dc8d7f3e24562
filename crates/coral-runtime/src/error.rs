//! Runtime error types.

use thiserror::Error;

use coral_framework::{BusError, PluginError};

use crate::config::ConfigError;

/// Errors that can occur while building, starting or stopping the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The result consumer could not be started.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// A shutdown signal listener could not be installed.
    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[from] std::io::Error),

    #[error("Runtime is already running")]
    AlreadyRunning,

    #[error("Runtime is not running")]
    NotRunning,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
