//! Plugin system for the Coral framework.
//!
//! # Architecture
//!
//! A plugin is any type implementing [`Plugin`]. It reaches the loader as a
//! [`PluginDescriptor`]: its [`PluginMetadata`] plus a factory building a
//! fresh instance for every load. Descriptors are either installed directly
//! or collected at link time with [`export_plugin!`](crate::export_plugin).
//!
//! The [`PluginManager`] resolves declared dependencies into a
//! [`DependencyGraph`], loads plugins layer by layer and commits each plugin's
//! registrations atomically into the shared registry.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use coral::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
//!         setup.on(EventKind::Message, |event: Arc<Event>| async move {
//!             event.plain_text()
//!         });
//!         Ok(())
//!     }
//! }
//!
//! export_plugin!(ECHO = PluginDescriptor::new(PluginMetadata::new("echo"), || Echo));
//! ```
//!
//! # Configuration
//!
//! A plugin's configuration is its metadata `config` defaults overlaid with
//! the host's `plugins.config.<name>` section:
//!
//! ```toml
//! [plugins.config.echo]
//! prefix = "[bot]"
//! ```

// ─── Submodules ──────────────────────────────────────────────────────────────
pub mod admin;
pub mod core;
pub mod graph;
pub mod manager;
pub mod metadata;
pub mod meter;
pub mod record;

// ─── Re-exports from submodules ──────────────────────────────────────────────
pub use admin::{ListFilter, OpResult, PLUGIN_COMMAND_HELP, PluginCommand, admin_command};
pub use self::core::{
    PLUGIN_REGISTRY, Plugin, PluginContext, PluginDescriptor, PluginSetup, discover_plugins,
};
pub use graph::DependencyGraph;
pub use manager::{BatchReport, LoaderConfig, LoaderStats, PluginManager};
pub use metadata::{PLUGIN_API_VERSION, PluginMetadata, format_api_version};
pub use meter::{MeterLayer, Metered};
pub use record::{LoadStatus, PluginMetrics, PluginState, PluginSummary, SharedPluginMetrics};

// ─── Macro-internal re-export (needed by export_plugin! at call sites) ───────
#[doc(hidden)]
pub use linkme as __linkme;
