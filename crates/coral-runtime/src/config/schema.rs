//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use coral_framework::{BusConfig, DEFAULT_PRIORITY, EngineConfig, LoaderConfig, QueuePolicy};

use super::loader::Profile;

/// Root configuration structure.
///
/// ```toml
/// [bus]
/// queue_capacity = 1000
/// command_prefix = "/"
///
/// [plugins]
/// max_concurrency = 5
/// disabled = ["weather"]
///
/// [plugins.config.echo]
/// prefix = "[bot]"
///
/// [logging]
/// level = "debug"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoralConfig {
    /// Event bus and command routing.
    #[serde(default)]
    pub bus: BusSection,

    /// Plugin loader settings and per-plugin configuration.
    #[serde(default)]
    pub plugins: PluginsSection,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoralConfig {
    /// Built-in defaults for a profile.
    ///
    /// Development logs at debug level with source locations; every other
    /// profile keeps the plain defaults.
    pub fn for_profile(profile: &Profile) -> Self {
        let mut config = Self::default();
        if matches!(profile, Profile::Development) {
            config.logging.level = LogLevel::Debug;
            config.logging.file_location = true;
        }
        config
    }

    /// Translates the loaded sections into engine settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bus: self.bus.to_bus_config(),
            loader: self.plugins.to_loader_config(),
            command_prefix: self.bus.command_prefix.clone(),
            reply_unknown_commands: self.bus.reply_unknown_commands,
            admin_command: self.plugins.admin_command,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub queue_policy: QueuePolicy,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Per-handler time limit; unset means unbounded.
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,

    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Messages starting with this prefix are routed as commands.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: Option<String>,

    #[serde(default = "default_true")]
    pub reply_unknown_commands: bool,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_policy: QueuePolicy::default(),
            batch_size: default_batch_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
            handler_timeout_ms: None,
            default_priority: default_priority(),
            command_prefix: default_command_prefix(),
            reply_unknown_commands: true,
        }
    }
}

impl BusSection {
    pub fn to_bus_config(&self) -> BusConfig {
        BusConfig {
            queue_capacity: self.queue_capacity,
            queue_policy: self.queue_policy,
            batch_size: self.batch_size,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            handler_timeout: self.handler_timeout_ms.map(Duration::from_millis),
            default_priority: self.default_priority,
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_command_prefix() -> Option<String> {
    Some("/".to_string())
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Plugins
// =============================================================================

/// `[plugins]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Time limit for `plugin_load` / `plugin_unload`.
    #[serde(default)]
    pub hook_timeout_ms: Option<u64>,

    /// Plugins installed in the disabled state.
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Load every installed plugin when the runtime starts.
    #[serde(default = "default_true")]
    pub autoload: bool,

    /// Register the built-in `plugin` admin command.
    #[serde(default = "default_true")]
    pub admin_command: bool,

    /// Per-plugin configuration, keyed by plugin name.
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            hook_timeout_ms: None,
            disabled: Vec::new(),
            autoload: true,
            admin_command: true,
            config: HashMap::new(),
        }
    }
}

impl PluginsSection {
    pub fn to_loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            max_concurrency: self.max_concurrency,
            hook_timeout: self.hook_timeout_ms.map(Duration::from_millis),
            plugin_configs: self.config.clone(),
            disabled: self.disabled.clone(),
        }
    }
}

fn default_max_concurrency() -> usize {
    5
}

// =============================================================================
// Logging
// =============================================================================

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Span lifecycle events to log.
    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of the log call.
    #[serde(default)]
    pub file_location: bool,

    /// Target file when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Rotated log files to keep (daily rotation).
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    /// Per-module levels, e.g. `coral_framework = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            max_files: default_max_files(),
            filters: HashMap::new(),
        }
    }
}

fn default_max_files() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of the fmt layer. `json` needs the `json-log` feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: CoralConfig = serde_json::from_value(json!({
            "bus": { "queue_capacity": 64, "queue_policy": "drop_newest" },
            "plugins": { "config": { "echo": { "prefix": ">" } } },
        }))
        .unwrap();

        assert_eq!(config.bus.queue_capacity, 64);
        assert_eq!(config.bus.queue_policy, QueuePolicy::DropNewest);
        assert_eq!(config.bus.batch_size, 10);
        assert_eq!(config.bus.command_prefix.as_deref(), Some("/"));
        assert_eq!(config.plugins.max_concurrency, 5);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_engine_config_translation() {
        let mut config = CoralConfig::default();
        config.bus.handler_timeout_ms = Some(250);
        config.plugins.hook_timeout_ms = Some(1500);
        config.plugins.disabled = vec!["weather".into()];
        config.plugins.config.insert("echo".into(), json!({ "prefix": ">" }));

        let engine = config.engine_config();
        assert_eq!(engine.bus.handler_timeout, Some(Duration::from_millis(250)));
        assert_eq!(engine.bus.drain_timeout, Duration::from_secs(1));
        assert_eq!(engine.loader.hook_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(engine.loader.disabled, vec!["weather".to_string()]);
        assert_eq!(engine.loader.plugin_configs["echo"], json!({ "prefix": ">" }));
        assert_eq!(engine.command_prefix.as_deref(), Some("/"));
    }

    #[test]
    fn test_profile_defaults() {
        let dev = CoralConfig::for_profile(&Profile::Development);
        assert_eq!(dev.logging.level, LogLevel::Debug);
        assert!(dev.logging.file_location);

        let prod = CoralConfig::for_profile(&Profile::Production);
        assert_eq!(prod.logging.level, LogLevel::Info);
        assert_eq!(prod.logging.format, LogFormat::Compact);
    }
}
