//! # Coral Framework
//!
//! The event dispatch core and plugin loader of the Coral bot framework.
//!
//! This layer provides:
//! - A priority-ordered event bus with a middleware chain and a bounded result queue
//! - Tower-based handlers built from plain async closures
//! - Command routing with permission checks
//! - A dependency-aware plugin loader with per-plugin metrics
//!
//! Everything hangs off an [`Engine`] value; there is no global state apart
//! from the link-time plugin list collected by [`export_plugin!`].

pub mod bus;
pub mod command;
pub mod engine;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod permission;
pub mod plugin;
pub mod registry;
pub mod subscription;

pub use bus::{
    BusConfig, BusMetrics, EventBus, MetricsSnapshot, PublishOutcome, QueuePolicy, ReplySink,
};
pub use command::CommandRouter;
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{
    BoxError, BusError, CyclicDependencyError, HandlerError, HandlerTimeout, PluginError,
    PluginResult, RegistryError,
};
pub use handler::{BoxedHandler, HandlerResult, IntoReplies, handler_fn};
pub use middleware::{Middleware, middleware_fn};
pub use permission::{AllowAll, PermissionChecker, PermissionTable};
pub use plugin::{
    LoaderConfig, Plugin, PluginContext, PluginDescriptor, PluginManager, PluginMetadata,
    PluginSetup, PluginState,
};
pub use registry::{
    BoxedFunction, CommandEntry, FunctionEntry, Registry, SharedRegistry, call_function,
    function_fn,
};
pub use subscription::{DEFAULT_PRIORITY, SubscribeOptions, SubscriptionId, filters};
