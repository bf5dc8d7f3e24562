//! Operator-facing plugin operations.
//!
//! Every operation here returns an [`OpResult`] instead of an error: the
//! boundary is consumed by chat commands and consoles that only show text.
//! [`admin_command`] wires the same operations to the `plugin` bot command.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::warn;

use coral_core::Event;

use crate::handler::{BoxedHandler, handler_fn};
use crate::permission::PermissionChecker;

use super::manager::PluginManager;
use super::metadata::format_api_version;
use super::record::{PluginState, PluginSummary};

/// `(success, message)` result of a boundary operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<OpResult> for (bool, String) {
    fn from(result: OpResult) -> Self {
        (result.success, result.message)
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Which plugins `list` shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    #[default]
    All,
    Loaded,
    /// Anything not disabled.
    Enabled,
    Disabled,
    Error,
}

impl ListFilter {
    fn accepts(self, state: PluginState) -> bool {
        match self {
            Self::All => true,
            Self::Loaded => state == PluginState::Loaded,
            Self::Enabled => state != PluginState::Disabled,
            Self::Disabled => state == PluginState::Disabled,
            Self::Error => state == PluginState::Error,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }
}

impl FromStr for ListFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "loaded" => Ok(Self::Loaded),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "error" | "errors" => Ok(Self::Error),
            other => Err(format!(
                "Unknown filter '{other}'. Use one of: all, loaded, enabled, disabled, error"
            )),
        }
    }
}

// =============================================================================
// Boundary operations
// =============================================================================

impl PluginManager {
    pub async fn load(&self, name: &str) -> OpResult {
        match self.load_plugin(name).await {
            Ok(()) => OpResult::ok(format!("Plugin {name} loaded successfully")),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    pub async fn unload(&self, name: &str) -> OpResult {
        match self.unload_plugin(name).await {
            Ok(()) => OpResult::ok(format!("Plugin {name} unloaded successfully")),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    pub async fn reload(&self, name: &str) -> OpResult {
        match self.reload_plugin(name).await {
            Ok(()) => OpResult::ok(format!("Plugin {name} reloaded successfully")),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    pub async fn enable(&self, name: &str) -> OpResult {
        match self.enable_plugin(name).await {
            Ok(()) => OpResult::ok(format!("Plugin {name} enabled")),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    pub async fn disable(&self, name: &str) -> OpResult {
        match self.disable_plugin(name).await {
            Ok(()) => OpResult::ok(format!("Plugin {name} disabled")),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    /// One line per plugin matching `filter`.
    pub fn list(&self, filter: ListFilter) -> OpResult {
        let plugins: Vec<PluginSummary> = self
            .plugins()
            .into_iter()
            .filter(|p| filter.accepts(p.state))
            .collect();
        if plugins.is_empty() {
            return OpResult::ok(format!("No plugins ({})", filter.as_str()));
        }
        let mut text = format!("Plugins ({}): {}", filter.as_str(), plugins.len());
        for p in &plugins {
            let _ = write!(text, "\n  {} v{} [{}]", p.name, p.version, p.state);
            if !p.description.is_empty() {
                let _ = write!(text, " - {}", p.description);
            }
        }
        OpResult::ok(text)
    }

    /// Metrics for one plugin, or the loader-wide summary.
    pub fn stats(&self, name: Option<&str>) -> OpResult {
        let Some(name) = name else {
            return OpResult::ok(self.overall_stats().to_string());
        };
        let Some(info) = self.plugin_info(name) else {
            return OpResult::fail(format!("Plugin {name} not found"));
        };
        let m = &info.metrics;
        let mut text = format!("Statistics for {name}");
        let _ = write!(text, "\n  State: {}", info.state);
        let _ = write!(text, "\n  Loads: {}, unloads: {}", m.load_count, m.unload_count);
        let _ = write!(text, "\n  Last load time: {:.3}s", m.load_time.as_secs_f64());
        let _ = write!(
            text,
            "\n  Calls: {}, errors: {}, avg time: {:.3}ms",
            m.total_calls,
            m.total_errors,
            m.avg_execution_time().as_secs_f64() * 1000.0
        );
        if let Some(error) = &m.last_error {
            let _ = write!(text, "\n  Last error: {error}");
        }
        OpResult::ok(text)
    }

    /// Metadata, state and current registrations of one plugin.
    pub fn info(&self, name: &str) -> OpResult {
        let Some(info) = self.plugin_info(name) else {
            return OpResult::fail(format!("Plugin {name} not found"));
        };
        let Ok(required_by) = self.build_graph().map(|graph| {
            graph
                .dependents(name)
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        }) else {
            return OpResult::fail(format!("Plugin {name}: dependency graph has a cycle"));
        };
        let owned = self.registrations_of(name);
        let compatibility = self
            .metadata_of(name)
            .map(|m| format_api_version(m.compatibility))
            .unwrap_or_default();

        let mut text = format!("{} v{} by {}", info.name, info.version, info.author);
        if !info.description.is_empty() {
            let _ = write!(text, "\n  {}", info.description);
        }
        let _ = write!(text, "\n  State: {}", info.state);
        if let Some(status) = info.status {
            let _ = write!(text, " (last load: {status})");
        }
        let _ = write!(text, "\n  API: {compatibility}");
        let _ = write!(text, "\n  Depends on: {}", join_or_none(&info.dependencies));
        let _ = write!(text, "\n  Required by: {}", join_or_none(&required_by));
        let _ = write!(text, "\n  Commands: {}", join_or_none(&owned.commands));
        let _ = write!(text, "\n  Functions: {}", join_or_none(&owned.functions));
        let _ = write!(text, "\n  Subscriptions: {}", owned.subscriptions.len());
        OpResult::ok(text)
    }

    pub async fn load_all_plugins(&self) -> OpResult {
        match self.load_all(self.config().max_concurrency).await {
            Ok(report) if report.failed.is_empty() => OpResult::ok(report.to_string()),
            Ok(report) => OpResult::fail(report.to_string()),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }

    pub async fn unload_all_plugins(&self) -> OpResult {
        let report = self.unload_all().await;
        OpResult {
            success: report.failed.is_empty(),
            message: report.to_string(),
        }
    }

    pub async fn reload_all_plugins(&self) -> OpResult {
        match self.reload_all().await {
            Ok(report) if report.failed.is_empty() => OpResult::ok(report.to_string()),
            Ok(report) => OpResult::fail(report.to_string()),
            Err(e) => OpResult::fail(e.to_string()),
        }
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

// =============================================================================
// `plugin` command
// =============================================================================

/// A parsed `plugin …` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCommand {
    Load(String),
    Unload(String),
    Enable(String),
    Disable(String),
    Reload(String),
    ReloadAll,
    List(ListFilter),
    Stats(Option<String>),
    Info(String),
    Help,
}

pub const PLUGIN_COMMAND_HELP: &str = "\
Usage: plugin <subcommand>
  load <name>       load a plugin
  unload <name>     unload a plugin
  enable <name>     allow a disabled plugin to load
  disable <name>    unload and block a plugin
  reload <name|all> reload one plugin or every plugin
  list [filter]     all, loaded, enabled, disabled, error
  stats [name]      plugin or system statistics
  info <name>       plugin details";

impl PluginCommand {
    /// Parses whitespace-split arguments.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, String> {
        let mut args = args.iter().map(AsRef::as_ref);
        let Some(sub) = args.next() else {
            return Ok(Self::Help);
        };
        let name = args.next();
        let need = |name: Option<&str>| {
            name.map(str::to_string)
                .ok_or_else(|| format!("Usage: plugin {sub} <name>"))
        };
        match sub.to_ascii_lowercase().as_str() {
            "load" => need(name).map(Self::Load),
            "unload" => need(name).map(Self::Unload),
            "enable" => need(name).map(Self::Enable),
            "disable" => need(name).map(Self::Disable),
            "reload" => match name {
                Some("all") => Ok(Self::ReloadAll),
                _ => need(name).map(Self::Reload),
            },
            "list" => name.map_or(Ok(ListFilter::All), str::parse).map(Self::List),
            "stats" => Ok(Self::Stats(name.map(str::to_string))),
            "info" => need(name).map(Self::Info),
            "help" => Ok(Self::Help),
            other => Err(format!("Unknown subcommand '{other}'\n{PLUGIN_COMMAND_HELP}")),
        }
    }

    /// Subcommand name, used for the `plugin.<subcommand>` permission.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Unload(_) => "unload",
            Self::Enable(_) => "enable",
            Self::Disable(_) => "disable",
            Self::Reload(_) | Self::ReloadAll => "reload",
            Self::List(_) => "list",
            Self::Stats(_) => "stats",
            Self::Info(_) => "info",
            Self::Help => "help",
        }
    }

    /// Runs the command against `manager`.
    pub async fn execute(self, manager: &PluginManager) -> OpResult {
        match self {
            Self::Load(name) => manager.load(&name).await,
            Self::Unload(name) => manager.unload(&name).await,
            Self::Enable(name) => manager.enable(&name).await,
            Self::Disable(name) => manager.disable(&name).await,
            Self::Reload(name) => manager.reload(&name).await,
            Self::ReloadAll => manager.reload_all_plugins().await,
            Self::List(filter) => manager.list(filter),
            Self::Stats(name) => manager.stats(name.as_deref()),
            Self::Info(name) => manager.info(&name),
            Self::Help => OpResult::ok(PLUGIN_COMMAND_HELP),
        }
    }
}

/// Handler for the `plugin` command.
///
/// Holds the manager weakly: the manager owns the registry that owns this
/// handler.
pub fn admin_command(
    manager: Weak<PluginManager>,
    permissions: Arc<dyn PermissionChecker>,
) -> BoxedHandler {
    handler_fn(move |event: Arc<Event>| {
        let manager = manager.clone();
        let permissions = permissions.clone();
        async move {
            let Some(command) = event.as_command() else {
                return None;
            };
            let parsed = match PluginCommand::parse(&command.args) {
                Ok(parsed) => parsed,
                Err(usage) => return Some(usage),
            };

            if parsed != PluginCommand::Help {
                let permission = format!("plugin.{}", parsed.subcommand());
                let allowed = permissions
                    .check_permission(&[permission.as_str()], &command.user, command.group.as_ref())
                    .await;
                if !allowed {
                    warn!(user = %command.user.user_id, %permission, "Plugin command denied");
                    return Some("Permission denied".to_string());
                }
            }

            let Some(manager) = manager.upgrade() else {
                return Some("Plugin manager is not available".to_string());
            };
            Some(parsed.execute(&manager).await.message)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coral_core::{CommandEvent, UserInfo};
    use tower::ServiceExt;

    use crate::error::BoxError;
    use crate::permission::{AllowAll, PermissionTable};
    use crate::plugin::{LoaderConfig, Plugin, PluginDescriptor, PluginMetadata, PluginSetup};
    use crate::registry::Registry;
    use crate::subscription::DEFAULT_PRIORITY;

    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
        async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
            setup.command(format!("{}_ping", setup.name()), |_e: Arc<Event>| async { "pong" });
            Ok(())
        }
    }

    fn manager() -> Arc<PluginManager> {
        let manager = PluginManager::new(Registry::shared(DEFAULT_PRIORITY), LoaderConfig::default());
        manager
            .install(PluginDescriptor::new(
                PluginMetadata::new("B").description("base"),
                || Quiet,
            ))
            .unwrap();
        manager
            .install(PluginDescriptor::new(PluginMetadata::new("C").depends_on("B"), || Quiet))
            .unwrap();
        Arc::new(manager)
    }

    fn plugin_command(user: &str, args: &[&str]) -> Arc<Event> {
        let args = args.iter().map(|a| a.to_string()).collect();
        Arc::new(CommandEvent::new("console", "bot", UserInfo::new("console", user), "plugin", args).into())
    }

    #[tokio::test]
    async fn test_unload_in_use_returns_failure_pair() {
        let manager = manager();
        assert!(manager.load_all_plugins().await.success);

        let (ok, message) = manager.unload("B").await.into();
        assert!(!ok);
        assert_eq!(message, "Cannot unload B: other plugins depend on it: C");
        assert_eq!(manager.plugin_state("B"), Some(PluginState::Loaded));
    }

    #[tokio::test]
    async fn test_boundary_messages() {
        let manager = manager();
        let loaded = manager.load_all_plugins().await;
        assert!(loaded.message.starts_with("Loaded 2 plugins, 0 failed in "));

        assert_eq!(manager.load("nope").await, OpResult::fail("Plugin nope not found"));
        assert!(manager.list(ListFilter::Loaded).message.contains("B v1.0.0 [loaded] - base"));
        assert_eq!(manager.list(ListFilter::Disabled).message, "No plugins (disabled)");
        assert!(manager.info("B").message.contains("Required by: C"));
        assert!(manager.info("B").message.contains("Commands: B_ping"));
        assert!(manager.stats(Some("C")).message.contains("Loads: 1, unloads: 0"));
        assert!(manager.stats(None).message.contains("2 loaded"));

        let unloaded = manager.unload_all_plugins().await;
        assert!(unloaded.success);
        assert_eq!(manager.overall_stats().loaded, 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!(PluginCommand::parse::<&str>(&[]), Ok(PluginCommand::Help));
        assert_eq!(PluginCommand::parse(&["load", "echo"]), Ok(PluginCommand::Load("echo".into())));
        assert_eq!(PluginCommand::parse(&["reload", "all"]), Ok(PluginCommand::ReloadAll));
        assert_eq!(PluginCommand::parse(&["list", "error"]), Ok(PluginCommand::List(ListFilter::Error)));
        assert_eq!(PluginCommand::parse(&["stats"]), Ok(PluginCommand::Stats(None)));
        assert_eq!(PluginCommand::parse(&["load"]), Err("Usage: plugin load <name>".to_string()));
        assert!(PluginCommand::parse(&["list", "bogus"]).is_err());
        assert!(PluginCommand::parse(&["frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn test_admin_command_checks_permission() {
        let manager = manager();
        let table = Arc::new(PermissionTable::new());
        table.grant("root", "plugin.load");
        let handler = admin_command(Arc::downgrade(&manager), table);

        let denied = handler.clone().oneshot(plugin_command("eve", &["load", "B"])).await.unwrap();
        assert_eq!(denied[0].text().as_deref(), Some("Permission denied"));
        assert_eq!(manager.plugin_state("B"), Some(PluginState::Unloaded));

        let granted = handler.oneshot(plugin_command("root", &["load", "B"])).await.unwrap();
        assert_eq!(granted[0].text().as_deref(), Some("Plugin B loaded successfully"));
        assert_eq!(manager.plugin_state("B"), Some(PluginState::Loaded));
    }

    #[tokio::test]
    async fn test_admin_command_after_manager_dropped() {
        let manager = manager();
        let handler = admin_command(Arc::downgrade(&manager), Arc::new(AllowAll));
        drop(manager);

        let reply = handler.oneshot(plugin_command("root", &["list"])).await.unwrap();
        assert_eq!(reply[0].text().as_deref(), Some("Plugin manager is not available"));
    }
}
