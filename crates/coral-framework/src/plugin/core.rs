use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower_layer::Layer;

use coral_core::{Event, EventKind};

use crate::error::{BoxError, PluginError, PluginResult, RegistryError};
use crate::handler::{BoxedHandler, IntoReplies, handler_fn};
use crate::registry::{
    BoxedFunction, CommandEntry, FunctionEntry, PendingSubscription, Registrations, SharedRegistry,
    call_function,
};
use crate::subscription::SubscribeOptions;

use super::meter::MeterLayer;
use super::metadata::PluginMetadata;
use super::record::SharedPluginMetrics;

// ─── Plugin ─────────────────────────────────────────────────────────────────

/// A loadable unit of bot behaviour.
///
/// `setup` stages the plugin's subscriptions, commands and functions. The
/// loader commits them, then runs `plugin_load`; if the hook refuses, the
/// registrations are withdrawn. Both hooks default to accepting.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Plugin for Echo {
///     async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
///         setup.command("echo", |event: Arc<Event>| async move {
///             event.as_command().map(|c| c.args.join(" "))
///         });
///         Ok(())
///     }
/// }
/// ```
///
/// # Concurrency
///
/// Plugins are `Send + Sync`. Use interior mutability for state that changes
/// across events.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Registers everything this plugin contributes.
    async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError>;

    /// Called once the registrations from `setup` are committed, so the
    /// plugin can already call its own functions.
    ///
    /// Returning `Ok(false)` aborts the load and withdraws those registrations.
    async fn plugin_load(&self, _ctx: &PluginContext) -> Result<bool, BoxError> {
        Ok(true)
    }

    /// Called before registrations are removed.
    ///
    /// Returning `Ok(false)` keeps the plugin loaded.
    async fn plugin_unload(&self, _ctx: &PluginContext) -> Result<bool, BoxError> {
        Ok(true)
    }
}

// ─── PluginDescriptor ───────────────────────────────────────────────────────

type Factory = Arc<dyn Fn() -> Result<Arc<dyn Plugin>, BoxError> + Send + Sync>;

/// Metadata plus a factory that builds a fresh plugin value for each load.
#[derive(Clone)]
pub struct PluginDescriptor {
    metadata: PluginMetadata,
    factory: Factory,
}

impl PluginDescriptor {
    pub fn new<P, F>(metadata: PluginMetadata, factory: F) -> Self
    where
        P: Plugin,
        F: Fn() -> P + Send + Sync + 'static,
    {
        Self {
            metadata,
            factory: Arc::new(move || Ok(Arc::new(factory()) as Arc<dyn Plugin>)),
        }
    }

    /// Like [`new`](Self::new) for factories that can fail.
    pub fn try_new<P, E, F>(metadata: PluginMetadata, factory: F) -> Self
    where
        P: Plugin,
        E: Into<BoxError>,
        F: Fn() -> Result<P, E> + Send + Sync + 'static,
    {
        Self {
            metadata,
            factory: Arc::new(move || {
                factory()
                    .map(|p| Arc::new(p) as Arc<dyn Plugin>)
                    .map_err(Into::into)
            }),
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Builds a live plugin. Factory errors and panics become [`PluginError::Init`].
    pub fn instantiate(&self) -> PluginResult<Arc<dyn Plugin>> {
        match catch_unwind(AssertUnwindSafe(|| (self.factory)())) {
            Ok(Ok(plugin)) => Ok(plugin),
            Ok(Err(e)) => Err(PluginError::init(self.name(), e)),
            Err(_) => Err(PluginError::init(self.name(), "plugin factory panicked")),
        }
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// ─── Static discovery ───────────────────────────────────────────────────────

/// Descriptors contributed at link time by [`export_plugin!`](crate::export_plugin).
#[distributed_slice]
pub static PLUGIN_REGISTRY: [fn() -> PluginDescriptor];

/// Every descriptor linked into the binary.
pub fn discover_plugins() -> Vec<PluginDescriptor> {
    PLUGIN_REGISTRY.iter().map(|make| make()).collect()
}

/// Adds a plugin descriptor to the link-time registry.
///
/// ```rust,ignore
/// coral_framework::export_plugin!(ECHO = PluginDescriptor::new(
///     PluginMetadata::new("echo").description("Echoes messages"),
///     || Echo,
/// ));
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($ident:ident = $descriptor:expr $(,)?) => {
        #[$crate::plugin::__linkme::distributed_slice($crate::plugin::PLUGIN_REGISTRY)]
        #[linkme(crate = $crate::plugin::__linkme)]
        static $ident: fn() -> $crate::plugin::PluginDescriptor = || $descriptor;
    };
}

// ─── PluginSetup ────────────────────────────────────────────────────────────

/// Staging area handed to [`Plugin::setup`].
///
/// Nothing registered here is visible to dispatch until the loader commits it.
pub struct PluginSetup {
    name: String,
    config: Arc<Value>,
    meter: MeterLayer,
    staged: Registrations,
}

impl PluginSetup {
    pub(crate) fn new(name: &str, config: Arc<Value>, metrics: SharedPluginMetrics) -> Self {
        Self {
            name: name.to_string(),
            config,
            meter: MeterLayer::new(metrics),
            staged: Registrations::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deserialises this plugin's configuration into `T`.
    pub fn config<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.config.as_ref())
    }

    fn metered(&self, handler: BoxedHandler) -> BoxedHandler {
        BoxCloneSyncService::new(self.meter.layer(handler))
    }

    /// Subscribes an async closure to `kind`.
    pub fn on<F, Fut, R>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(Arc<Event>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReplies,
    {
        self.on_with(kind, handler_fn(handler), SubscribeOptions::new())
    }

    /// Subscribes a prepared handler with explicit options.
    pub fn on_with(
        &mut self,
        kind: EventKind,
        handler: BoxedHandler,
        mut options: SubscribeOptions,
    ) -> &mut Self {
        if options.label.is_none() {
            let n = self.staged.subscriptions.len();
            options.label = Some(format!("{}.{kind}#{n}", self.name));
        }
        let handler = self.metered(handler);
        self.staged.subscriptions.push(PendingSubscription {
            kind,
            handler,
            options,
        });
        self
    }

    /// Registers an async closure as the handler for command `name`.
    pub fn command<F, Fut, R>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<Event>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReplies,
    {
        self.command_with(CommandEntry::new(name, handler_fn(handler)))
    }

    /// Registers a fully described command.
    pub fn command_with(&mut self, mut entry: CommandEntry) -> &mut Self {
        entry.handler = self.metered(entry.handler);
        self.staged.commands.push(entry);
        self
    }

    /// Exposes a function other plugins can call by name.
    pub fn function(&mut self, name: impl Into<String>, func: BoxedFunction) -> &mut Self {
        self.staged.functions.push(FunctionEntry::new(name, func));
        self
    }

    pub(crate) fn into_registrations(self) -> Registrations {
        self.staged
    }
}

// ─── PluginContext ──────────────────────────────────────────────────────────

/// Handed to lifecycle hooks.
#[derive(Clone)]
pub struct PluginContext {
    name: String,
    config: Arc<Value>,
    registry: SharedRegistry,
}

impl PluginContext {
    pub(crate) fn new(name: &str, config: Arc<Value>, registry: SharedRegistry) -> Self {
        Self {
            name: name.to_string(),
            config,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deserialises this plugin's configuration into `T`.
    ///
    /// Use `#[serde(default)]` on `T` to make every field optional.
    pub fn config<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.config.as_ref())
    }

    pub fn raw_config(&self) -> &Value {
        &self.config
    }

    /// Calls a function registered by any loaded plugin.
    pub async fn call_function(&self, name: &str, args: Value) -> Result<Value, RegistryError> {
        call_function(&self.registry, name, args).await
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
