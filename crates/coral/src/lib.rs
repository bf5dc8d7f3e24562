//! # Coral
//!
//! An event-driven chat bot framework built around a dispatch core and a
//! dependency-aware plugin loader.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ publish ┌────────────────────────────────────────┐  results  ┌───────────┐
//! │   Adapter   │────────▶│ Engine                                 │──────────▶│ ReplySink │
//! └─────────────┘         │  middleware ─▶ handlers (by priority)  │           └───────────┘
//!                         │  command router ─▶ plugin commands     │
//!                         │  PluginManager ─▶ Registry             │
//!                         └────────────────────────────────────────┘
//! ```
//!
//! - **Engine**: owns the registry, the event bus and the plugin manager
//! - **Plugins**: units of behaviour registering subscriptions, commands and functions
//! - **Runtime**: configuration, logging and signal handling around one engine
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use coral::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
//!         setup.command("echo", |event: Arc<Event>| async move {
//!             event.as_command().map(|c| c.args.join(" "))
//!         });
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(ECHO = PluginDescriptor::new(PluginMetadata::new("echo"), || Echo));
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     CoralRuntime::builder().build()?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` (default): read `coral.toml`
//! - `yaml-config`: read `coral.yaml`
//! - `json-log`: JSON log output

pub use coral_core as core;
pub use coral_framework as framework;
pub use coral_runtime as runtime;

/// Commonly used types for writing plugins and wiring a bot.
///
/// ```rust,ignore
/// use coral::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;

    // Runtime - main entry point
    pub use coral_runtime::{CoralConfig, CoralRuntime, RuntimeBuilder};

    // Plugin system
    pub use coral_framework::export_plugin;
    pub use coral_framework::{
        Plugin, PluginContext, PluginDescriptor, PluginManager, PluginMetadata, PluginSetup,
        PluginState,
    };

    // Dispatch
    pub use coral_framework::{
        BoxError, CommandEntry, Engine, EventBus, PermissionChecker, PermissionTable,
        PublishOutcome, ReplySink, SubscribeOptions, filters, function_fn, handler_fn,
        middleware_fn,
    };

    // Data model
    pub use coral_core::{
        ActionRequest, CommandEvent, Event, EventKind, GenericEvent, GroupInfo, MessageChain,
        MessageEvent, MessageRequest, MessageSegment, NoticeEvent, ReplyResult, UserInfo,
    };
}
