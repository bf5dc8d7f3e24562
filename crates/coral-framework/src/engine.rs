//! The engine value that owns the registry, the bus and the loader.
//!
//! Nothing in the framework is a process global: every component receives
//! the pieces it needs from the [`Engine`] at construction time.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use coral_core::{CommandEvent, Event, EventKind};

use crate::bus::{BusConfig, EventBus, PublishOutcome, ReplySink};
use crate::command::CommandRouter;
use crate::error::{BusError, PluginResult, RegistryError};
use crate::permission::{AllowAll, PermissionChecker};
use crate::plugin::{BatchReport, LoaderConfig, PluginManager, admin_command};
use crate::registry::{CommandEntry, Registry, SharedRegistry, call_function};
use crate::subscription::SubscribeOptions;

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bus: BusConfig,
    pub loader: LoaderConfig,
    /// Messages starting with this prefix are also published as commands.
    pub command_prefix: Option<String>,
    /// Reply "No command found" to unknown commands.
    pub reply_unknown_commands: bool,
    /// Register the built-in `plugin` command.
    pub admin_command: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            loader: LoaderConfig::default(),
            command_prefix: Some("/".to_string()),
            reply_unknown_commands: true,
            admin_command: true,
        }
    }
}

/// Builder for [`Engine`].
///
/// ```rust,ignore
/// let engine = EngineBuilder::new()
///     .bus(BusConfig { queue_capacity: 64, ..Default::default() })
///     .permissions(Arc::new(my_checker))
///     .build();
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    permissions: Option<Arc<dyn PermissionChecker>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: BusConfig) -> Self {
        self.config.bus = bus;
        self
    }

    pub fn loader(mut self, loader: LoaderConfig) -> Self {
        self.config.loader = loader;
        self
    }

    /// Defaults to [`AllowAll`].
    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// `None` disables deriving commands from messages.
    pub fn command_prefix(mut self, prefix: Option<String>) -> Self {
        self.config.command_prefix = prefix;
        self
    }

    pub fn reply_unknown_commands(mut self, enabled: bool) -> Self {
        self.config.reply_unknown_commands = enabled;
        self
    }

    pub fn admin_command(mut self, enabled: bool) -> Self {
        self.config.admin_command = enabled;
        self
    }

    pub fn build(self) -> Engine {
        let EngineConfig {
            bus,
            loader,
            command_prefix,
            reply_unknown_commands,
            admin_command: with_admin,
        } = self.config;
        let permissions = self.permissions.unwrap_or_else(|| Arc::new(AllowAll));

        let registry = Registry::shared(bus.default_priority);
        let bus = EventBus::with_registry(bus, registry.clone());
        let plugins = Arc::new(PluginManager::new(registry.clone(), loader));

        let router = CommandRouter::new(registry.clone(), permissions.clone())
            .reply_unknown(reply_unknown_commands);
        bus.subscribe(
            EventKind::Command,
            router.into_handler(),
            SubscribeOptions::new().label("command_router"),
        );

        if with_admin {
            let entry = CommandEntry::new(
                "plugin",
                admin_command(Arc::downgrade(&plugins), permissions.clone()),
            )
            .description("Manage plugins");
            if let Err(e) = registry.write().register_command(entry) {
                warn!(error = %e, "Could not register the plugin command");
            }
        }

        debug!(prefix = ?command_prefix, admin = with_admin, "Engine built");
        Engine {
            registry,
            bus,
            plugins,
            permissions,
            command_prefix,
        }
    }
}

/// Owner of the registry, the event bus, the permission checker and the plugin manager.
pub struct Engine {
    registry: SharedRegistry,
    bus: EventBus,
    plugins: Arc<PluginManager>,
    permissions: Arc<dyn PermissionChecker>,
    command_prefix: Option<String>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionChecker> {
        &self.permissions
    }

    /// Publishes an event; prefixed messages are then published again as commands.
    ///
    /// Returns the outcome for the original event.
    pub async fn publish(&self, event: impl Into<Event>) -> PublishOutcome {
        let event = event.into();
        let command = match (&event, self.command_prefix.as_deref()) {
            (Event::Message(message), Some(prefix)) => CommandEvent::from_message(message, prefix),
            _ => None,
        };

        let outcome = self.bus.publish(event).await;
        if let Some(command) = command
            && matches!(outcome, PublishOutcome::Dispatched { .. })
        {
            let name = command.command.clone();
            let routed = self.bus.publish(command).await;
            debug!(command = %name, outcome = ?routed, "Command dispatched");
        }
        outcome
    }

    /// Loads every installed plugin with the configured concurrency.
    pub async fn load_plugins(&self) -> PluginResult<BatchReport> {
        self.plugins
            .load_all(self.plugins.config().max_concurrency)
            .await
    }

    pub async fn call_function(&self, name: &str, args: Value) -> Result<Value, RegistryError> {
        call_function(&self.registry, name, args).await
    }

    /// Starts delivering queued results to `sink`.
    pub fn start(&self, sink: Arc<dyn ReplySink>) -> Result<(), BusError> {
        self.bus.start(sink)
    }

    /// Unloads every plugin (dependents first), then drains the result queue.
    pub async fn shutdown(&self) {
        let report = self.plugins.unload_all().await;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some plugins did not unload cleanly");
        }
        self.bus.shutdown().await;
        info!("Engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bus", &self.bus)
            .field("plugins", &self.plugins)
            .field("command_prefix", &self.command_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coral_core::{MessageEvent, ReplyResult, UserInfo};
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::error::BoxError;
    use crate::middleware::middleware_fn;
    use crate::plugin::{Plugin, PluginDescriptor, PluginMetadata, PluginSetup};
    use crate::registry::function_fn;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
            setup
                .command("echo", |event: Arc<Event>| async move {
                    event.as_command().map(|c| c.args.join(" "))
                })
                .function(
                    "echo.upper",
                    function_fn(|v: Value| async move {
                        Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
                    }),
                );
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl ReplySink for Collect {
        async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError> {
            self.0.lock().push(reply.text().unwrap_or_default());
            Ok(())
        }
    }

    fn message(text: &str) -> MessageEvent {
        MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), text)
    }

    async fn engine_with_echo() -> Engine {
        let engine = EngineBuilder::new().build();
        engine
            .plugins()
            .install(PluginDescriptor::new(PluginMetadata::new("echo"), || Echo))
            .unwrap();
        engine.load_plugins().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_prefixed_message_becomes_command() {
        let engine = engine_with_echo().await;
        let sink = Arc::new(Collect::default());
        engine.start(sink.clone()).unwrap();

        engine.publish(message("/echo hello world")).await;
        engine.publish(message("/missing")).await;
        engine.publish(message("plain chat")).await;
        engine.shutdown().await;

        assert_eq!(*sink.0.lock(), vec!["hello world", "No command found: missing"]);
    }

    #[tokio::test]
    async fn test_vetoed_message_is_not_routed() {
        let engine = engine_with_echo().await;
        engine.bus().add_middleware(
            "block_all_messages",
            middleware_fn(|event: Event| async move {
                (event.kind() != EventKind::Message).then_some(event)
            }),
        );

        let outcome = engine.publish(message("/echo hi")).await;
        assert!(outcome.is_vetoed());
        assert_eq!(engine.bus().queue_size(), 0);
    }

    #[tokio::test]
    async fn test_plugin_command_and_functions() {
        let engine = engine_with_echo().await;
        let sink = Arc::new(Collect::default());
        tokio_test::assert_ok!(engine.start(sink.clone()));
        tokio_test::assert_err!(engine.start(sink.clone()));

        assert_eq!(
            engine.call_function("echo.upper", json!("abc")).await.unwrap(),
            json!("ABC")
        );

        engine.publish(message("/plugin unload echo")).await;
        engine.publish(message("/echo gone")).await;
        engine.shutdown().await;

        assert_eq!(
            *sink.0.lock(),
            vec!["Plugin echo unloaded successfully", "No command found: echo"]
        );
        assert!(engine.call_function("echo.upper", json!("abc")).await.is_err());
    }
}
