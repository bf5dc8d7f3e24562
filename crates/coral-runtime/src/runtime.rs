//! Process-level orchestration: configuration, logging, plugins, shutdown.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use coral_runtime::CoralRuntime;
//!
//! // Loads coral.toml from the current directory, installs every plugin
//! // exported with `export_plugin!`, and runs until Ctrl+C.
//! let runtime = CoralRuntime::builder().sink(Arc::new(MySender)).build()?;
//! runtime.run().await?;
//! ```
//!
//! Adapters feed events through [`CoralRuntime::engine`]; results leave
//! through the configured [`ReplySink`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coral_core::ReplyResult;
use coral_framework::plugin::{LoaderStats, discover_plugins};
use coral_framework::{
    BoxError, Engine, MetricsSnapshot, PermissionChecker, PluginDescriptor, ReplySink,
};

use crate::config::{ConfigLoader, CoralConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Sink used when no external sender is configured: every result is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ReplySink for LogSink {
    async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError> {
        match reply.text() {
            Some(text) => info!(target: "coral::reply", platform = reply.platform(), %text, "Reply"),
            None => info!(target: "coral::reply", platform = reply.platform(), ?reply, "Action"),
        }
        Ok(())
    }
}

/// Point-in-time view of the bus and the loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeStats {
    pub bus: MetricsSnapshot,
    pub plugins: LoaderStats,
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.bus)?;
        write!(f, "{}", self.plugins)
    }
}

/// The Coral runtime: one [`Engine`], its configuration and its reply sink.
///
/// A runtime is started once. After [`stop`](Self::stop) the result queue is
/// drained and cannot be restarted; build a new runtime instead.
pub struct CoralRuntime {
    config: CoralConfig,
    engine: Arc<Engine>,
    sink: Arc<dyn ReplySink>,
    running: Mutex<bool>,
}

impl CoralRuntime {
    /// Loads configuration from the default locations, falling back to
    /// defaults when loading fails.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                CoralConfig::default()
            });
        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builds a runtime from an already loaded configuration, installing
    /// every plugin linked in with `export_plugin!`.
    pub fn from_config(config: &CoralConfig) -> Self {
        let runtime = Self::assemble(config.clone(), None, Arc::new(LogSink));
        runtime.install_discovered();
        runtime
    }

    fn assemble(
        config: CoralConfig,
        permissions: Option<Arc<dyn PermissionChecker>>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        logging::init_from_config(&config.logging);

        let mut builder = Engine::builder().config(config.engine_config());
        if let Some(permissions) = permissions {
            builder = builder.permissions(permissions);
        }
        let engine = Arc::new(builder.build());

        info!(
            log_level = %config.logging.level,
            queue_capacity = config.bus.queue_capacity,
            max_concurrency = config.plugins.max_concurrency,
            "Runtime initialized from configuration"
        );

        Self {
            config,
            engine,
            sink,
            running: Mutex::new(false),
        }
    }

    fn install_discovered(&self) {
        for descriptor in discover_plugins() {
            let name = descriptor.name().to_string();
            match self.engine.plugins().install(descriptor) {
                Ok(()) => debug!(plugin = %name, "Installed linked plugin"),
                Err(e) => warn!(plugin = %name, error = %e, "Skipping linked plugin"),
            }
        }
    }

    pub fn config(&self) -> &CoralConfig {
        &self.config
    }

    /// The engine adapters publish into.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            bus: self.engine.bus().metrics(),
            plugins: self.engine.plugins().overall_stats(),
        }
    }

    /// Starts result delivery, then loads plugins when `plugins.autoload` is set.
    ///
    /// Individual plugin failures are logged; only a dependency cycle or a
    /// second concurrent load aborts the start.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut running = self.running.lock().await;
        if *running {
            return Err(RuntimeError::AlreadyRunning);
        }

        info!("Starting Coral runtime");
        self.engine.start(self.sink.clone())?;

        if self.config.plugins.autoload {
            let report = self.engine.load_plugins().await?;
            info!("{report}");
            for (plugin, reason) in &report.failed {
                warn!(plugin = %plugin, %reason, "Plugin failed to load");
            }
        }

        *running = true;
        info!("Runtime started");
        Ok(())
    }

    /// Unloads every plugin and drains the result queue.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let mut running = self.running.lock().await;
        if !*running {
            return Err(RuntimeError::NotRunning);
        }

        info!("Stopping Coral runtime");
        self.engine.shutdown().await;
        *running = false;
        info!("Runtime stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Coral runtime is now running. Press Ctrl+C to stop.");

        let waited = wait_for_shutdown().await;
        self.stop().await?;
        waited
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

impl Default for CoralRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoralRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoralRuntime")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`CoralRuntime`] with custom configuration sources,
/// permissions, sink and plugins.
///
/// ```rust,ignore
/// let runtime = CoralRuntime::builder()
///     .config_file("deploy/coral.toml")
///     .profile("production")
///     .permissions(Arc::new(table))
///     .plugin(PluginDescriptor::new(PluginMetadata::new("echo"), || Echo))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    permissions: Option<Arc<dyn PermissionChecker>>,
    sink: Option<Arc<dyn ReplySink>>,
    plugins: Vec<PluginDescriptor>,
    discover: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            permissions: None,
            sink: None,
            plugins: Vec::new(),
            discover: true,
        }
    }

    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: CoralConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Where results are delivered. Defaults to [`LogSink`].
    pub fn sink(mut self, sink: Arc<dyn ReplySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Installs a plugin in addition to the linked ones.
    pub fn plugin(mut self, descriptor: PluginDescriptor) -> Self {
        self.plugins.push(descriptor);
        self
    }

    /// Whether plugins exported with `export_plugin!` are installed (default: true).
    pub fn discover(mut self, enabled: bool) -> Self {
        self.discover = enabled;
        self
    }

    /// Loads the configuration and installs plugins.
    ///
    /// An explicitly added plugin that cannot be installed fails the build.
    pub fn build(self) -> RuntimeResult<CoralRuntime> {
        let config = self.config_loader.load()?;
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let runtime = CoralRuntime::assemble(config, self.permissions, sink);

        for descriptor in self.plugins {
            runtime.engine.plugins().install(descriptor)?;
        }
        if self.discover {
            runtime.install_discovered();
        }
        Ok(runtime)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
