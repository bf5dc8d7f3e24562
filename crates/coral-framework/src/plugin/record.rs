//! Per-plugin bookkeeping: lifecycle state, load outcome and usage metrics.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::core::{Plugin, PluginContext, PluginDescriptor};

// ─── PluginState ────────────────────────────────────────────────────────────

/// Lifecycle state of an installed plugin.
///
/// ```text
///            load                 ok
/// Unloaded ───────▶ Loading ─────────▶ Loaded
///    ▲  │              │                 │
///    │  │ disable      │ fail            │ unload
///    │  ▼              ▼                 │
/// Disabled          Error ◀──────────────┘ (any state on failure)
///    ▲                 │ retry
///    └── disable ──────┴──────▶ Loading
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Error,
    Disabled,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    /// Whether the loader may move a plugin from `self` to `next`.
    pub fn can_transition(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loaded, Unloaded)
                | (Error, Loading)
                | (Error, Unloaded)
                | (Unloaded, Disabled)
                | (Error, Disabled)
                | (Disabled, Unloaded)
                | (_, Error)
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Success,
    Failed,
    /// Not attempted because the plugin is disabled or already loaded.
    Skipped,
    /// Not attempted because a dependency is not loaded.
    DependencyFailed,
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::DependencyFailed => "dependency failed",
        })
    }
}

// ─── PluginMetrics ──────────────────────────────────────────────────────────

/// Load and usage counters for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PluginMetrics {
    /// Duration of the last successful load.
    pub load_time: Duration,
    pub load_count: u64,
    pub unload_count: u64,
    pub last_loaded: Option<SystemTime>,
    pub total_calls: u64,
    pub total_execution_time: Duration,
    pub total_errors: u64,
    pub last_error: Option<String>,
}

impl PluginMetrics {
    pub(crate) fn record_load(&mut self, elapsed: Duration) {
        self.load_time = elapsed;
        self.load_count += 1;
        self.last_loaded = Some(SystemTime::now());
    }

    pub(crate) fn record_unload(&mut self) {
        self.unload_count += 1;
    }

    pub(crate) fn record_call(&mut self, elapsed: Duration, failed: bool) {
        self.total_calls += 1;
        self.total_execution_time += elapsed;
        if failed {
            self.total_errors += 1;
        }
    }

    pub(crate) fn record_error(&mut self, error: impl ToString) {
        self.total_errors += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn avg_execution_time(&self) -> Duration {
        match u32::try_from(self.total_calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_execution_time / calls,
            Err(_) => Duration::from_secs_f64(
                self.total_execution_time.as_secs_f64() / self.total_calls as f64,
            ),
        }
    }
}

/// Shared handle so metering layers can update a record they do not own.
pub type SharedPluginMetrics = Arc<Mutex<PluginMetrics>>;

// ─── PluginRecord ───────────────────────────────────────────────────────────

/// Everything the loader tracks about one installed plugin.
pub(crate) struct PluginRecord {
    pub(crate) descriptor: PluginDescriptor,
    pub(crate) state: PluginState,
    pub(crate) status: Option<LoadStatus>,
    pub(crate) metrics: SharedPluginMetrics,
    /// Live instance while loaded.
    pub(crate) instance: Option<Arc<dyn Plugin>>,
    pub(crate) context: Option<PluginContext>,
}

impl PluginRecord {
    pub(crate) fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            state: PluginState::Unloaded,
            status: None,
            metrics: Arc::default(),
            instance: None,
            context: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.metadata().name
    }

    /// Moves to `next`, returning `false` and changing nothing if the move is not allowed.
    pub(crate) fn transition(&mut self, next: PluginState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn summary(&self) -> PluginSummary {
        let metadata = self.descriptor.metadata();
        PluginSummary {
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            author: metadata.author.clone(),
            description: metadata.description.clone(),
            state: self.state,
            status: self.status,
            dependencies: metadata.dependencies.clone(),
            metrics: self.metrics.lock().clone(),
        }
    }
}

/// Read-only view of one plugin for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub state: PluginState,
    pub status: Option<LoadStatus>,
    pub dependencies: Vec<String>,
    pub metrics: PluginMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use PluginState::*;
        assert!(Unloaded.can_transition(Loading));
        assert!(Loading.can_transition(Loaded));
        assert!(Loaded.can_transition(Unloaded));
        assert!(Error.can_transition(Loading));
        assert!(Disabled.can_transition(Unloaded));
        assert!(Loaded.can_transition(Error));

        assert!(!Unloaded.can_transition(Loaded));
        assert!(!Loaded.can_transition(Loading));
        assert!(!Disabled.can_transition(Loading));
        assert!(!Loaded.can_transition(Disabled));
    }

    #[test]
    fn test_metrics_average() {
        let mut metrics = PluginMetrics::default();
        assert_eq!(metrics.avg_execution_time(), Duration::ZERO);

        metrics.record_call(Duration::from_millis(10), false);
        metrics.record_call(Duration::from_millis(30), true);
        assert_eq!(metrics.avg_execution_time(), Duration::from_millis(20));
        assert_eq!(metrics.total_errors, 1);

        metrics.record_error("boom");
        assert_eq!(metrics.last_error.as_deref(), Some("boom"));
        assert_eq!(metrics.total_errors, 2);
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&PluginState::Loaded).unwrap(), r#""loaded""#);
        assert_eq!(PluginState::Disabled.to_string(), "disabled");
    }
}
