//! Error types for the Coral framework.
//!
//! Dispatch never fails: handler and middleware errors are logged and counted
//! by the bus. The types here describe registry conflicts and plugin lifecycle
//! failures, which the loader turns into `(success, message)` replies at its
//! public boundary.

use std::time::Duration;

use thiserror::Error;

use crate::plugin::PluginState;

pub use tower::BoxError;

/// Error type returned by handlers and middleware.
pub type HandlerError = BoxError;

// =============================================================================
// Registry Errors
// =============================================================================

/// Errors raised while mutating or querying the [`Registry`](crate::Registry).
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A command with this name is already registered.
    #[error("command '{name}' is already registered by {owner}")]
    DuplicateCommand {
        /// Command name.
        name: String,
        /// Current owner ("core" for engine-level registrations).
        owner: String,
    },

    /// A function with this name is already registered.
    #[error("function '{name}' is already registered by {owner}")]
    DuplicateFunction {
        /// Function name.
        name: String,
        /// Current owner.
        owner: String,
    },

    /// No function with this name is registered.
    #[error("function '{0}' not found")]
    FunctionNotFound(String),

    /// The function ran and returned an error.
    #[error("function '{name}' failed: {reason}")]
    FunctionFailed {
        /// Function name.
        name: String,
        /// Rendered error.
        reason: String,
    },
}

impl RegistryError {
    pub(crate) fn owner_label(owner: Option<&str>) -> String {
        owner.unwrap_or("core").to_string()
    }
}

// =============================================================================
// Bus Errors
// =============================================================================

/// Errors raised by the [`EventBus`](crate::EventBus) lifecycle.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// `start` was called while a consumer is already running.
    #[error("result consumer is already running")]
    AlreadyStarted,

    /// The result queue has been consumed by a previous run and cannot be restarted.
    #[error("result queue receiver is no longer available")]
    QueueUnavailable,
}

/// A handler ran longer than the configured timeout.
#[derive(Debug, Clone, Error)]
#[error("handler '{handler}' timed out after {timeout:?}")]
pub struct HandlerTimeout {
    /// Subscription label.
    pub handler: String,
    /// The configured limit.
    pub timeout: Duration,
}

// =============================================================================
// Plugin Errors
// =============================================================================

/// The installed plugin set contains at least one dependency cycle.
///
/// Every plugin on every detected cycle is named in [`plugins`](Self::plugins).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circular dependency detected in plugins: {}", render_cycles(.cycles))]
pub struct CyclicDependencyError {
    /// Each detected cycle as a dependency path, first plugin repeated at the end.
    pub cycles: Vec<Vec<String>>,
}

impl CyclicDependencyError {
    /// Sorted, de-duplicated names of every plugin on a detected cycle.
    pub fn plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cycles.iter().flatten().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

fn render_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by plugin installation and lifecycle operations.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error(transparent)]
    CyclicDependency(#[from] CyclicDependencyError),

    /// One or more declared dependencies are not loaded.
    #[error("Missing dependencies for {plugin}: {}", .missing.join(", "))]
    DependencyUnmet {
        plugin: String,
        missing: Vec<String>,
    },

    /// Loaded plugins still depend on the plugin being unloaded.
    #[error("Cannot unload {plugin}: other plugins depend on it: {}", .dependents.join(", "))]
    DependencyInUse {
        plugin: String,
        dependents: Vec<String>,
    },

    /// The declared compatibility version does not match the loader.
    #[error(
        "Plugin {plugin} is not compatible with this version (declares {declared:#010x}, loader is {loader:#010x})"
    )]
    Incompatible {
        plugin: String,
        declared: u32,
        loader: u32,
    },

    /// Instantiating or setting up the plugin failed.
    #[error("Failed to initialise plugin {plugin}: {reason}")]
    Init { plugin: String, reason: String },

    /// A lifecycle hook returned `false`.
    #[error("Plugin {plugin} rejected {hook}")]
    HookRejected { plugin: String, hook: &'static str },

    /// A lifecycle hook returned an error or panicked.
    #[error("Plugin {plugin} {hook} failed: {reason}")]
    HookFailed {
        plugin: String,
        hook: &'static str,
        reason: String,
    },

    /// A lifecycle hook exceeded the configured timeout.
    #[error("Plugin {plugin} {hook} timed out after {timeout:?}")]
    HookTimeout {
        plugin: String,
        hook: &'static str,
        timeout: Duration,
    },

    #[error("Plugin {0} not found")]
    NotFound(String),

    #[error("Plugin {0} is already installed")]
    AlreadyInstalled(String),

    #[error("Plugin {0} is disabled. Use 'plugin enable {0}' first.")]
    Disabled(String),

    /// The operation is not valid from the plugin's current state.
    #[error("Plugin {plugin} cannot {operation} while {state}")]
    InvalidState {
        plugin: String,
        state: PluginState,
        operation: &'static str,
    },

    #[error("Plugin loading already in progress")]
    LoadInProgress,

    #[error("Invalid metadata for plugin {plugin}: {reason}")]
    InvalidMetadata { plugin: String, reason: String },

    /// The plugin's registrations conflict with existing ones.
    #[error("Registry rejected plugin {plugin}: {source}")]
    Registry {
        plugin: String,
        #[source]
        source: RegistryError,
    },
}

impl PluginError {
    pub(crate) fn init(plugin: &str, reason: impl ToString) -> Self {
        Self::Init {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_state(plugin: &str, state: PluginState, operation: &'static str) -> Self {
        Self::InvalidState {
            plugin: plugin.to_string(),
            state,
            operation,
        }
    }

    pub(crate) fn invalid_metadata(plugin: &str, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_every_plugin() {
        let err = CyclicDependencyError {
            cycles: vec![
                vec!["P".into(), "Q".into(), "P".into()],
                vec!["R".into(), "R".into()],
            ],
        };

        assert_eq!(err.plugins(), vec!["P", "Q", "R"]);
        assert_eq!(
            err.to_string(),
            "Circular dependency detected in plugins: P -> Q -> P; R -> R"
        );
    }

    #[test]
    fn test_dependency_messages() {
        let err = PluginError::DependencyInUse {
            plugin: "B".into(),
            dependents: vec!["C".into(), "D".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot unload B: other plugins depend on it: C, D"
        );

        let err = PluginError::DependencyUnmet {
            plugin: "C".into(),
            missing: vec!["A".into(), "B".into()],
        };
        assert_eq!(err.to_string(), "Missing dependencies for C: A, B");
    }
}
