//! Plugin lifecycle management.
//!
//! [`PluginManager`] owns every installed plugin's record and drives the
//! lifecycle state machine:
//!
//! - **install / uninstall** add and remove descriptors.
//! - **load** checks dependencies and compatibility, instantiates the plugin,
//!   runs `setup` into a staging set, commits the staged registrations to the
//!   shared registry in one step, then awaits `plugin_load`. A failed hook
//!   withdraws the registrations again, and so does dropping the load future
//!   before it settles.
//! - **unload** refuses while loaded plugins depend on the target, awaits
//!   `plugin_unload`, then removes everything the plugin registered.
//! - **load_all** walks the dependency graph layer by layer. Plugins within a
//!   layer load concurrently, bounded by a semaphore; the next layer starts
//!   only after every attempt in the current one has settled.
//!
//! # Locking
//!
//! Records sit behind a `parking_lot` mutex that is never held across an
//! await. Lifecycle operations additionally share a `tokio` read/write lock:
//! loads take it shared so a layer can load concurrently, while unload,
//! reload, enable and disable take it exclusively.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = PluginManager::new(registry.clone(), LoaderConfig::default());
//! manager.install(echo_descriptor())?;
//! let report = manager.load_all(4).await?;
//! info!("{report}");
//! // …later…
//! manager.unload_all().await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{RwLock as AsyncRwLock, Semaphore};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{BoxError, CyclicDependencyError, PluginError, PluginResult};
use crate::registry::{OwnedRegistrations, SharedRegistry};

use super::core::{Plugin, PluginContext, PluginDescriptor, PluginSetup};
use super::graph::DependencyGraph;
use super::metadata::{PLUGIN_API_VERSION, PluginMetadata, format_api_version};
use super::record::{
    LoadStatus, PluginMetrics, PluginRecord, PluginState, PluginSummary, SharedPluginMetrics,
};

// =============================================================================
// Configuration & reports
// =============================================================================

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Upper bound on concurrent loads within one layer.
    pub max_concurrency: usize,
    /// Upper bound on `plugin_load` / `plugin_unload`.
    pub hook_timeout: Option<Duration>,
    /// Per-plugin configuration overriding metadata defaults, keyed by plugin name.
    pub plugin_configs: HashMap<String, Value>,
    /// Plugins installed in the disabled state.
    pub disabled: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            hook_timeout: None,
            plugin_configs: HashMap::new(),
            disabled: Vec::new(),
        }
    }
}

/// Outcome of a bulk lifecycle operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    /// Past-tense verb used in the summary line.
    #[serde(skip)]
    pub verb: &'static str,
    pub succeeded: Vec<String>,
    /// `(plugin, reason)` for every failed attempt.
    pub failed: Vec<(String, String)>,
    /// Plugins not attempted (disabled, or already in the target state).
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

impl BatchReport {
    fn new(verb: &'static str) -> Self {
        Self {
            verb,
            ..Self::default()
        }
    }

    fn record(&mut self, name: String, result: PluginResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(name),
            Err(e) => self.failed.push((name, e.to_string())),
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} plugins, {} failed in {:.2}s",
            self.verb,
            self.succeeded.len(),
            self.failed.len(),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Aggregate counts across all installed plugins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoaderStats {
    pub installed: usize,
    pub loaded: usize,
    pub unloaded: usize,
    pub error: usize,
    pub disabled: usize,
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_load_time: Duration,
}

impl fmt::Display for LoaderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plugin System Statistics")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(
            f,
            "Plugins: {} installed, {} loaded, {} unloaded, {} error, {} disabled",
            self.installed, self.loaded, self.unloaded, self.error, self.disabled
        )?;
        writeln!(f, "Calls: {}, errors: {}", self.total_calls, self.total_errors)?;
        write!(
            f,
            "Total load time: {:.3}s",
            self.total_load_time.as_secs_f64()
        )
    }
}

/// Moves a plugin out of `Loading` when its load future is dropped before
/// the attempt settles, e.g. by a caller's timeout.
struct PendingLoad<'a> {
    manager: &'a PluginManager,
    name: &'a str,
    settled: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let removed = self.manager.registry.write().remove_owner(self.name);
        if let Some(record) = self.manager.records.lock().get_mut(self.name) {
            record.instance = None;
            record.context = None;
            record.transition(PluginState::Error);
            record.status = Some(LoadStatus::Failed);
            record.metrics.lock().record_error("load cancelled");
        }
        warn!(plugin = %self.name, removed, "Plugin load cancelled");
    }
}

/// Clears the in-progress flag when a bulk load ends, however it ends.
struct LoadingFlag<'a>(&'a AtomicBool);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// PluginManager
// =============================================================================

/// Central owner of plugin records and lifecycle.
pub struct PluginManager {
    records: Mutex<BTreeMap<String, PluginRecord>>,
    registry: SharedRegistry,
    config: LoaderConfig,
    loading: AtomicBool,
    lifecycle: AsyncRwLock<()>,
}

impl PluginManager {
    pub fn new(registry: SharedRegistry, config: LoaderConfig) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            registry,
            config,
            loading: AtomicBool::new(false),
            lifecycle: AsyncRwLock::new(()),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    // ─── Installation ────────────────────────────────────────────────────────

    /// Adds a plugin in the `Unloaded` state (or `Disabled` if configured so).
    pub fn install(&self, descriptor: PluginDescriptor) -> PluginResult<()> {
        descriptor.metadata().validate()?;
        let name = descriptor.name().to_string();

        let mut records = self.records.lock();
        if records.contains_key(&name) {
            return Err(PluginError::AlreadyInstalled(name));
        }
        if !descriptor.metadata().is_compatible() {
            warn!(
                plugin = %name,
                declared = %format_api_version(descriptor.metadata().compatibility),
                loader = %format_api_version(PLUGIN_API_VERSION),
                "Plugin API version mismatch, it will be refused at load time"
            );
        }

        let mut record = PluginRecord::new(descriptor);
        if self.config.disabled.contains(&name) {
            record.transition(PluginState::Disabled);
        }
        info!(plugin = %name, state = %record.state, "Plugin installed");
        records.insert(name, record);
        Ok(())
    }

    /// Removes a plugin, unloading it first if loaded.
    pub async fn uninstall(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.write().await;
        let state = self.state_of(name)?;
        if state == PluginState::Loaded {
            self.unload_inner(name).await?;
        } else {
            let records = self.records.lock();
            let dependents = loaded_dependents(&records, name);
            if !dependents.is_empty() {
                return Err(PluginError::DependencyInUse {
                    plugin: name.to_string(),
                    dependents,
                });
            }
        }
        self.records.lock().remove(name);
        info!(plugin = %name, "Plugin uninstalled");
        Ok(())
    }

    /// Builds the dependency graph over every installed plugin.
    pub fn build_graph(&self) -> Result<DependencyGraph, CyclicDependencyError> {
        let metadata: Vec<PluginMetadata> = self
            .records
            .lock()
            .values()
            .map(|r| r.descriptor.metadata().clone())
            .collect();
        DependencyGraph::build(&metadata)
    }

    // ─── Single-plugin lifecycle ─────────────────────────────────────────────

    /// Loads one plugin whose dependencies are already loaded.
    pub async fn load_plugin(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.read().await;
        self.load_inner(name).await
    }

    /// Unloads one plugin that no loaded plugin depends on.
    pub async fn unload_plugin(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.write().await;
        self.unload_inner(name).await
    }

    /// Unloads (if loaded) and loads again.
    pub async fn reload_plugin(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.write().await;
        if self.state_of(name)? == PluginState::Loaded {
            self.unload_inner(name).await?;
        }
        self.load_inner(name).await
    }

    /// Moves a disabled plugin back to `Unloaded`.
    pub async fn enable_plugin(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.write().await;
        let mut records = self.records.lock();
        let record = records
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if record.state != PluginState::Disabled {
            return Err(PluginError::invalid_state(name, record.state, "enable"));
        }
        record.transition(PluginState::Unloaded);
        info!(plugin = %name, "Plugin enabled");
        Ok(())
    }

    /// Unloads the plugin if needed and marks it `Disabled`.
    pub async fn disable_plugin(&self, name: &str) -> PluginResult<()> {
        let _lifecycle = self.lifecycle.write().await;
        if self.state_of(name)? == PluginState::Loaded {
            self.unload_inner(name).await?;
        }
        let mut records = self.records.lock();
        let record = records
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if !record.transition(PluginState::Disabled) {
            return Err(PluginError::invalid_state(name, record.state, "disable"));
        }
        info!(plugin = %name, "Plugin disabled");
        Ok(())
    }

    // ─── Bulk lifecycle ──────────────────────────────────────────────────────

    /// Loads every installed plugin in dependency order.
    ///
    /// Fails only when another bulk load is running or the graph has a cycle;
    /// individual failures are collected in the report.
    pub async fn load_all(&self, max_concurrency: usize) -> PluginResult<BatchReport> {
        if self.loading.swap(true, Ordering::AcqRel) {
            return Err(PluginError::LoadInProgress);
        }
        let _flag = LoadingFlag(&self.loading);
        let _lifecycle = self.lifecycle.read().await;

        let graph = self.build_graph().inspect_err(|e| error!(error = %e, "Cannot load plugins"))?;
        let started = Instant::now();
        let semaphore = Semaphore::new(max_concurrency.max(1));
        let mut report = BatchReport::new("Loaded");

        for (depth, layer) in graph.topological_layers().into_iter().enumerate() {
            let mut pending = Vec::with_capacity(layer.len());
            {
                let records = self.records.lock();
                for name in layer {
                    match records.get(&name).map(|r| r.state) {
                        Some(PluginState::Unloaded | PluginState::Error) => pending.push(name),
                        _ => report.skipped.push(name),
                    }
                }
            }
            if pending.is_empty() {
                continue;
            }
            debug!(layer = depth, plugins = ?pending, "Loading layer");

            let attempts = pending.into_iter().map(|name| {
                let semaphore = &semaphore;
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    let result = self.load_inner(&name).await;
                    (name, result)
                }
            });
            for (name, result) in join_all(attempts).await {
                report.record(name, result);
            }
        }

        report.elapsed = started.elapsed();
        info!(
            loaded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed = ?report.elapsed,
            "Plugin loading finished"
        );
        Ok(report)
    }

    /// Unloads every loaded plugin, dependents before their dependencies.
    pub async fn unload_all(&self) -> BatchReport {
        let _lifecycle = self.lifecycle.write().await;
        let started = Instant::now();
        let mut report = BatchReport::new("Unloaded");

        let layers = match self.build_graph() {
            Ok(graph) => graph.topological_layers(),
            Err(e) => {
                warn!(error = %e, "Dependency cycle, unloading in name order");
                self.records.lock().keys().map(|n| vec![n.clone()]).collect()
            }
        };

        for layer in layers.into_iter().rev() {
            let loaded: Vec<String> = {
                let records = self.records.lock();
                layer
                    .into_iter()
                    .filter(|n| records.get(n).is_some_and(|r| r.state == PluginState::Loaded))
                    .collect()
            };
            let attempts = loaded.into_iter().map(|name| async move {
                let result = self.unload_inner(&name).await;
                (name, result)
            });
            for (name, result) in join_all(attempts).await {
                report.record(name, result);
            }
        }

        report.elapsed = started.elapsed();
        info!(
            unloaded = report.succeeded.len(),
            failed = report.failed.len(),
            "Plugin unloading finished"
        );
        report
    }

    /// Unloads everything, then loads everything again.
    pub async fn reload_all(&self) -> PluginResult<BatchReport> {
        let unloaded = self.unload_all().await;
        let mut report = self.load_all(self.config.max_concurrency).await?;
        report.verb = "Reloaded";
        let mut failed = unloaded.failed;
        failed.append(&mut report.failed);
        report.failed = failed;
        Ok(report)
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.records.lock().get(name).map(|r| r.state)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.lock().contains_key(name)
    }

    /// Every installed plugin, sorted by name.
    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.records.lock().values().map(PluginRecord::summary).collect()
    }

    pub fn plugin_info(&self, name: &str) -> Option<PluginSummary> {
        self.records.lock().get(name).map(PluginRecord::summary)
    }

    pub fn metadata_of(&self, name: &str) -> Option<PluginMetadata> {
        self.records
            .lock()
            .get(name)
            .map(|r| r.descriptor.metadata().clone())
    }

    pub fn plugin_metrics(&self, name: &str) -> Option<PluginMetrics> {
        self.records.lock().get(name).map(|r| r.metrics.lock().clone())
    }

    pub fn overall_stats(&self) -> LoaderStats {
        let records = self.records.lock();
        let mut stats = LoaderStats {
            installed: records.len(),
            ..LoaderStats::default()
        };
        for record in records.values() {
            match record.state {
                PluginState::Loaded => stats.loaded += 1,
                PluginState::Unloaded | PluginState::Loading => stats.unloaded += 1,
                PluginState::Error => stats.error += 1,
                PluginState::Disabled => stats.disabled += 1,
            }
            let metrics = record.metrics.lock();
            stats.total_calls += metrics.total_calls;
            stats.total_errors += metrics.total_errors;
            stats.total_load_time += metrics.load_time;
        }
        stats
    }

    /// What `name` currently has in the registry.
    pub fn registrations_of(&self, name: &str) -> OwnedRegistrations {
        self.registry.read().owned_by(name)
    }

    /// Metadata defaults overlaid with the host's section for this plugin.
    pub fn plugin_config(&self, metadata: &PluginMetadata) -> Value {
        let mut merged: Map<String, Value> = metadata.config.clone();
        match self.config.plugin_configs.get(&metadata.name) {
            Some(Value::Object(overrides)) => {
                for (key, value) in overrides {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => return other.clone(),
        }
        Value::Object(merged)
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn state_of(&self, name: &str) -> PluginResult<PluginState> {
        self.plugin_state(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    async fn load_inner(&self, name: &str) -> PluginResult<()> {
        let span = info_span!("load", plugin = %name);
        self.load_attempt(name).instrument(span).await
    }

    async fn load_attempt(&self, name: &str) -> PluginResult<()> {
        let (descriptor, metrics) = self.begin_load(name)?;
        let mut pending = PendingLoad {
            manager: self,
            name,
            settled: false,
        };
        let started = Instant::now();

        let outcome = self.run_load(&descriptor, &metrics).await;
        pending.settled = true;
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(name) else {
            return Err(PluginError::NotFound(name.to_string()));
        };
        match outcome {
            Ok((instance, context)) => {
                let elapsed = started.elapsed();
                record.instance = Some(instance);
                record.context = Some(context);
                record.transition(PluginState::Loaded);
                record.status = Some(LoadStatus::Success);
                metrics.lock().record_load(elapsed);
                info!(elapsed = ?elapsed, "Plugin loaded");
                Ok(())
            }
            Err(e) => {
                record.transition(PluginState::Error);
                record.status = Some(LoadStatus::Failed);
                metrics.lock().record_error(&e);
                error!(error = %e, "Plugin failed to load");
                Err(e)
            }
        }
    }

    /// Validates preconditions and moves the plugin to `Loading`.
    fn begin_load(&self, name: &str) -> PluginResult<(PluginDescriptor, SharedPluginMetrics)> {
        let mut records = self.records.lock();
        let record = records
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        match record.state {
            PluginState::Unloaded | PluginState::Error => {}
            PluginState::Disabled => {
                if let Some(record) = records.get_mut(name) {
                    record.status = Some(LoadStatus::Skipped);
                }
                return Err(PluginError::Disabled(name.to_string()));
            }
            state => return Err(PluginError::invalid_state(name, state, "load")),
        }

        let metadata = record.descriptor.metadata();
        let missing: Vec<String> = metadata
            .dependencies
            .iter()
            .filter(|dep| records.get(*dep).map(|r| r.state) != Some(PluginState::Loaded))
            .cloned()
            .collect();
        let compatible = metadata.is_compatible();
        let declared = metadata.compatibility;

        let Some(record) = records.get_mut(name) else {
            return Err(PluginError::NotFound(name.to_string()));
        };
        if !missing.is_empty() {
            warn!(plugin = %name, missing = ?missing, "Plugin dependencies are not loaded");
            record.status = Some(LoadStatus::DependencyFailed);
            return Err(PluginError::DependencyUnmet {
                plugin: name.to_string(),
                missing,
            });
        }
        if !compatible {
            let err = PluginError::Incompatible {
                plugin: name.to_string(),
                declared,
                loader: PLUGIN_API_VERSION,
            };
            record.status = Some(LoadStatus::Failed);
            record.metrics.lock().record_error(&err);
            return Err(err);
        }
        if !record.transition(PluginState::Loading) {
            return Err(PluginError::invalid_state(name, record.state, "load"));
        }
        Ok((record.descriptor.clone(), record.metrics.clone()))
    }

    /// Instantiate → setup → commit → `plugin_load`.
    async fn run_load(
        &self,
        descriptor: &PluginDescriptor,
        metrics: &SharedPluginMetrics,
    ) -> PluginResult<(Arc<dyn Plugin>, PluginContext)> {
        let name = descriptor.name();
        let instance = descriptor.instantiate()?;
        let config = Arc::new(self.plugin_config(descriptor.metadata()));

        let mut setup = PluginSetup::new(name, config.clone(), metrics.clone());
        AssertUnwindSafe(instance.setup(&mut setup))
            .catch_unwind()
            .await
            .map_err(|_| PluginError::init(name, "setup panicked"))?
            .map_err(|e| PluginError::init(name, e))?;
        let staged = setup.into_registrations();

        self.registry
            .write()
            .commit(name, staged)
            .map_err(|source| PluginError::Registry {
                plugin: name.to_string(),
                source,
            })?;
        debug!(registrations = ?self.registry.read().owned_by(name), "Registrations committed");

        let context = PluginContext::new(name, config, self.registry.clone());
        if let Err(e) = self
            .run_hook(name, "plugin_load", instance.plugin_load(&context))
            .await
        {
            let removed = self.registry.write().remove_owner(name);
            debug!(removed, "Registrations withdrawn after failed plugin_load");
            return Err(e);
        }
        Ok((instance, context))
    }

    async fn unload_inner(&self, name: &str) -> PluginResult<()> {
        let hooks = {
            let mut records = self.records.lock();
            let state = records
                .get(name)
                .map(|r| r.state)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            match state {
                PluginState::Loaded => {}
                PluginState::Error => {
                    if let Some(record) = records.get_mut(name) {
                        record.transition(PluginState::Unloaded);
                    }
                    info!(plugin = %name, "Cleared plugin error state");
                    return Ok(());
                }
                state => return Err(PluginError::invalid_state(name, state, "unload")),
            }
            let dependents = loaded_dependents(&records, name);
            if !dependents.is_empty() {
                return Err(PluginError::DependencyInUse {
                    plugin: name.to_string(),
                    dependents,
                });
            }
            records
                .get(name)
                .and_then(|r| r.instance.clone().zip(r.context.clone()))
        };

        if let Some((instance, context)) = hooks {
            let unloaded = self
                .run_hook(name, "plugin_unload", instance.plugin_unload(&context))
                .await;
            if let Err(e) = unloaded {
                warn!(plugin = %name, error = %e, "Plugin refused to unload");
                if let Some(record) = self.records.lock().get(name) {
                    record.metrics.lock().record_error(&e);
                }
                return Err(e);
            }
        }

        let removed = self.registry.write().remove_owner(name);
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(name) {
            record.instance = None;
            record.context = None;
            record.transition(PluginState::Unloaded);
            record.metrics.lock().record_unload();
        }
        info!(plugin = %name, removed, "Plugin unloaded");
        Ok(())
    }

    async fn run_hook<F>(&self, plugin: &str, hook: &'static str, fut: F) -> PluginResult<()>
    where
        F: Future<Output = Result<bool, BoxError>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.config.hook_timeout {
            Some(timeout) => tokio::time::timeout(timeout, guarded).await.map_err(|_| {
                PluginError::HookTimeout {
                    plugin: plugin.to_string(),
                    hook,
                    timeout,
                }
            })?,
            None => guarded.await,
        };
        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(PluginError::HookRejected {
                plugin: plugin.to_string(),
                hook,
            }),
            Ok(Err(e)) => Err(PluginError::HookFailed {
                plugin: plugin.to_string(),
                hook,
                reason: e.to_string(),
            }),
            Err(_) => Err(PluginError::HookFailed {
                plugin: plugin.to_string(),
                hook,
                reason: "hook panicked".into(),
            }),
        }
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.records.lock().keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Loaded or loading plugins that declare `name` as a dependency.
fn loaded_dependents(records: &BTreeMap<String, PluginRecord>, name: &str) -> Vec<String> {
    records
        .values()
        .filter(|r| matches!(r.state, PluginState::Loaded | PluginState::Loading))
        .filter(|r| r.descriptor.metadata().dependencies.iter().any(|d| d == name))
        .map(|r| r.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use coral_core::{Event, EventKind};
    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::registry::{Registry, function_fn};
    use crate::subscription::DEFAULT_PRIORITY;

    #[derive(Clone, Default)]
    struct TestPlugin {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject_load: bool,
        reject_unload: bool,
        barrier: Option<Arc<Barrier>>,
        in_flight: Option<(Arc<AtomicUsize>, Arc<AtomicUsize>)>,
        command: Option<&'static str>,
        delay: Option<Duration>,
        ping: bool,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        async fn setup(&self, setup: &mut PluginSetup) -> Result<(), BoxError> {
            setup.on(EventKind::Message, |_e: Arc<Event>| async {});
            if let Some(command) = self.command {
                setup.command(command, |_e: Arc<Event>| async { "ok" });
            }
            if self.ping {
                setup.function(
                    format!("{}.ping", self.name),
                    function_fn(|_args: Value| async { Ok(json!("pong")) }),
                );
            }
            Ok(())
        }

        async fn plugin_load(&self, ctx: &PluginContext) -> Result<bool, BoxError> {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if let Some((current, peak)) = &self.in_flight {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.ping {
                let reply = ctx.call_function(&format!("{}.ping", self.name), Value::Null).await?;
                if reply != json!("pong") {
                    return Ok(false);
                }
            }
            self.log.lock().push(format!("load:{}", self.name));
            Ok(!self.reject_load)
        }

        async fn plugin_unload(&self, _ctx: &PluginContext) -> Result<bool, BoxError> {
            self.log.lock().push(format!("unload:{}", self.name));
            Ok(!self.reject_unload)
        }
    }

    fn descriptor(plugin: TestPlugin, deps: &[&str]) -> PluginDescriptor {
        let meta = deps
            .iter()
            .fold(PluginMetadata::new(plugin.name), |m, d| m.depends_on(*d));
        PluginDescriptor::new(meta, move || plugin.clone())
    }

    fn manager() -> PluginManager {
        manager_with(LoaderConfig::default())
    }

    fn manager_with(config: LoaderConfig) -> PluginManager {
        PluginManager::new(Registry::shared(DEFAULT_PRIORITY), config)
    }

    fn test_plugin(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> TestPlugin {
        TestPlugin {
            name,
            log: log.clone(),
            ..TestPlugin::default()
        }
    }

    #[tokio::test]
    async fn test_chain_loads_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("C", &log), &["B"])).unwrap();
        manager.install(descriptor(test_plugin("B", &log), &["A"])).unwrap();
        manager.install(descriptor(test_plugin("A", &log), &[])).unwrap();

        assert_eq!(
            manager.build_graph().unwrap().topological_layers(),
            vec![vec!["A"], vec!["B"], vec!["C"]]
        );

        let report = manager.load_all(4).await.unwrap();
        assert_eq!(report.succeeded, vec!["A", "B", "C"]);
        assert_eq!(*log.lock(), vec!["load:A", "load:B", "load:C"]);
        for name in ["A", "B", "C"] {
            assert_eq!(manager.plugin_state(name), Some(PluginState::Loaded));
            assert_eq!(manager.plugin_metrics(name).unwrap().load_count, 1);
        }
    }

    #[tokio::test]
    async fn test_independent_plugins_load_concurrently() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));
        let manager = manager_with(LoaderConfig {
            hook_timeout: Some(Duration::from_secs(5)),
            ..LoaderConfig::default()
        });
        manager.install(descriptor(test_plugin("Z", &log), &[])).unwrap();
        for name in ["X", "Y"] {
            let p = TestPlugin {
                barrier: Some(barrier.clone()),
                ..test_plugin(name, &log)
            };
            manager.install(descriptor(p, &["Z"])).unwrap();
        }

        assert_eq!(
            manager.build_graph().unwrap().topological_layers(),
            vec![vec!["Z"], vec!["X", "Y"]]
        );

        // X and Y both wait on a two-party barrier: serial loading would time out.
        let report = manager.load_all(2).await.unwrap();
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(log.lock()[0], "load:Z");
        assert_eq!(manager.overall_stats().loaded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let counters = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let manager = manager();
        for name in ["p1", "p2", "p3", "p4", "p5"] {
            let p = TestPlugin {
                in_flight: Some(counters.clone()),
                ..test_plugin(name, &log)
            };
            manager.install(descriptor(p, &[])).unwrap();
        }

        let report = manager.load_all(2).await.unwrap();
        assert_eq!(report.succeeded.len(), 5);
        assert_eq!(counters.1.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cycle_fails_load_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("P", &log), &["Q"])).unwrap();
        manager.install(descriptor(test_plugin("Q", &log), &["P"])).unwrap();

        let err = manager.load_all(2).await.unwrap_err();
        match err {
            PluginError::CyclicDependency(cycle) => assert_eq!(cycle.plugins(), vec!["P", "Q"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().is_empty());
        assert_eq!(manager.plugin_state("P"), Some(PluginState::Unloaded));
    }

    #[tokio::test]
    async fn test_unload_refused_while_dependents_loaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("B", &log), &[])).unwrap();
        manager.install(descriptor(test_plugin("C", &log), &["B"])).unwrap();
        manager.load_all(2).await.unwrap();

        let err = manager.unload_plugin("B").await.unwrap_err();
        assert!(matches!(err, PluginError::DependencyInUse { ref dependents, .. } if dependents == &["C"]));
        assert_eq!(manager.plugin_state("B"), Some(PluginState::Loaded));
        assert_eq!(manager.registrations_of("B").total(), 1);

        manager.unload_plugin("C").await.unwrap();
        manager.unload_plugin("B").await.unwrap();
        assert_eq!(manager.plugin_state("B"), Some(PluginState::Unloaded));
        assert_eq!(manager.registry().read().stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_missing_dependency_leaves_state_unloaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("A", &log), &[])).unwrap();
        manager.install(descriptor(test_plugin("bot", &log), &["A", "ghost"])).unwrap();

        let err = manager.load_plugin("bot").await.unwrap_err();
        assert!(matches!(err, PluginError::DependencyUnmet { ref missing, .. } if missing == &["A", "ghost"]));
        assert_eq!(manager.plugin_state("bot"), Some(PluginState::Unloaded));
        assert_eq!(manager.plugin_info("bot").unwrap().status, Some(LoadStatus::DependencyFailed));
    }

    #[tokio::test]
    async fn test_incompatible_plugin_is_refused() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let plugin = test_plugin("future", &log);
        manager
            .install(PluginDescriptor::new(
                PluginMetadata::new("future").compatibility(0x0002_0000),
                move || plugin.clone(),
            ))
            .unwrap();

        let err = manager.load_plugin("future").await.unwrap_err();
        assert!(matches!(err, PluginError::Incompatible { declared: 0x0002_0000, .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_load_leaves_registry_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let p = TestPlugin {
            reject_load: true,
            command: Some("greet"),
            ..test_plugin("grumpy", &log)
        };
        manager.install(descriptor(p, &[])).unwrap();

        let err = manager.load_plugin("grumpy").await.unwrap_err();
        assert!(matches!(err, PluginError::HookRejected { hook: "plugin_load", .. }));
        assert_eq!(manager.plugin_state("grumpy"), Some(PluginState::Error));
        assert_eq!(manager.registrations_of("grumpy").total(), 0);
        assert!(manager.registry().read().command("greet").is_none());

        let metrics = manager.plugin_metrics("grumpy").unwrap();
        assert!(metrics.last_error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_registry_conflict_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        for name in ["first", "second"] {
            let p = TestPlugin {
                command: Some("dup"),
                ..test_plugin(name, &log)
            };
            manager.install(descriptor(p, &[])).unwrap();
        }

        manager.load_plugin("first").await.unwrap();
        let err = manager.load_plugin("second").await.unwrap_err();

        assert!(matches!(err, PluginError::Registry { .. }));
        assert_eq!(manager.plugin_state("second"), Some(PluginState::Error));
        assert_eq!(manager.registrations_of("second").total(), 0);
        // the hook never ran: registrations are checked before plugin_load
        assert!(!log.lock().contains(&"load:second".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_unload_keeps_plugin_loaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let p = TestPlugin {
            reject_unload: true,
            ..test_plugin("sticky", &log)
        };
        manager.install(descriptor(p, &[])).unwrap();
        manager.load_plugin("sticky").await.unwrap();

        let err = manager.unload_plugin("sticky").await.unwrap_err();
        assert!(matches!(err, PluginError::HookRejected { hook: "plugin_unload", .. }));
        assert_eq!(manager.plugin_state("sticky"), Some(PluginState::Loaded));
        assert_eq!(manager.registrations_of("sticky").total(), 1);
    }

    #[tokio::test]
    async fn test_reload_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let p = TestPlugin {
            command: Some("greet"),
            ..test_plugin("greeter", &log)
        };
        manager.install(descriptor(p, &[])).unwrap();
        manager.load_plugin("greeter").await.unwrap();
        let fresh = manager.registrations_of("greeter");

        manager.reload_plugin("greeter").await.unwrap();
        manager.reload_plugin("greeter").await.unwrap();

        assert_eq!(manager.plugin_state("greeter"), Some(PluginState::Loaded));
        assert_eq!(manager.registrations_of("greeter"), fresh);
        let metrics = manager.plugin_metrics("greeter").unwrap();
        assert_eq!((metrics.load_count, metrics.unload_count), (3, 2));
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(LoaderConfig {
            disabled: vec!["quiet".into()],
            ..LoaderConfig::default()
        });
        manager.install(descriptor(test_plugin("quiet", &log), &[])).unwrap();
        assert_eq!(manager.plugin_state("quiet"), Some(PluginState::Disabled));

        let err = manager.load_plugin("quiet").await.unwrap_err();
        assert_eq!(err.to_string(), "Plugin quiet is disabled. Use 'plugin enable quiet' first.");

        manager.enable_plugin("quiet").await.unwrap();
        manager.load_plugin("quiet").await.unwrap();
        manager.disable_plugin("quiet").await.unwrap();

        assert_eq!(manager.plugin_state("quiet"), Some(PluginState::Disabled));
        assert_eq!(manager.registrations_of("quiet").total(), 0);
        assert_eq!(*log.lock(), vec!["load:quiet", "unload:quiet"]);
    }

    #[tokio::test]
    async fn test_unload_all_reverses_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("A", &log), &[])).unwrap();
        manager.install(descriptor(test_plugin("B", &log), &["A"])).unwrap();
        manager.load_all(2).await.unwrap();
        log.lock().clear();

        let report = manager.unload_all().await;
        assert_eq!(report.to_string().split(" in ").next(), Some("Unloaded 2 plugins, 0 failed"));
        assert_eq!(*log.lock(), vec!["unload:B", "unload:A"]);
    }

    #[tokio::test]
    async fn test_second_bulk_load_is_refused() {
        let manager = manager();
        manager.loading.store(true, Ordering::SeqCst);
        assert!(matches!(manager.load_all(1).await, Err(PluginError::LoadInProgress)));
    }

    #[test]
    fn test_plugin_config_overlay() {
        let manager = manager_with(LoaderConfig {
            plugin_configs: HashMap::from([("weather".to_string(), json!({ "units": "imperial" }))]),
            ..LoaderConfig::default()
        });
        let meta = PluginMetadata::new("weather")
            .config_default("units", "metric")
            .config_default("days", 3);

        assert_eq!(
            manager.plugin_config(&meta),
            json!({ "units": "imperial", "days": 3 })
        );
    }

    #[tokio::test]
    async fn test_install_rejects_duplicates_and_uninstall() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        manager.install(descriptor(test_plugin("A", &log), &[])).unwrap();
        assert!(matches!(
            manager.install(descriptor(test_plugin("A", &log), &[])),
            Err(PluginError::AlreadyInstalled(_))
        ));

        manager.load_plugin("A").await.unwrap();
        manager.uninstall("A").await.unwrap();
        assert!(!manager.contains("A"));
        assert_eq!(manager.registry().read().stats().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_layer_waits_for_slow_sibling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let slow = TestPlugin {
            delay: Some(Duration::from_millis(50)),
            ..test_plugin("A", &log)
        };
        manager.install(descriptor(slow, &[])).unwrap();
        manager.install(descriptor(test_plugin("D", &log), &[])).unwrap();
        manager.install(descriptor(test_plugin("B", &log), &["D"])).unwrap();

        assert_eq!(
            manager.build_graph().unwrap().topological_layers(),
            vec![vec!["A", "D"], vec!["B"]]
        );

        // B only needs D, yet must not start before A has settled.
        let report = manager.load_all(4).await.unwrap();
        assert_eq!(report.succeeded, vec!["A", "D", "B"]);
        assert_eq!(*log.lock(), vec!["load:D", "load:A", "load:B"]);
    }

    #[tokio::test]
    async fn test_failed_plugin_does_not_stop_other_loads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let broken = TestPlugin {
            reject_load: true,
            ..test_plugin("broken", &log)
        };
        manager.install(descriptor(test_plugin("base", &log), &[])).unwrap();
        manager.install(descriptor(broken, &[])).unwrap();
        manager.install(descriptor(test_plugin("sibling", &log), &[])).unwrap();
        manager.install(descriptor(test_plugin("later", &log), &["base"])).unwrap();
        manager
            .install(descriptor(test_plugin("needs_broken", &log), &["broken"]))
            .unwrap();

        let report = manager.load_all(4).await.unwrap();
        assert_eq!(report.succeeded, vec!["base", "sibling", "later"]);
        let failed: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["broken", "needs_broken"]);

        assert_eq!(manager.plugin_state("broken"), Some(PluginState::Error));
        assert_eq!(manager.plugin_state("later"), Some(PluginState::Loaded));
        assert_eq!(manager.plugin_state("needs_broken"), Some(PluginState::Unloaded));
        assert_eq!(
            manager.plugin_info("needs_broken").unwrap().status,
            Some(LoadStatus::DependencyFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_load_leaves_plugin_retryable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let slow = TestPlugin {
            delay: Some(Duration::from_millis(200)),
            command: Some("slow"),
            ..test_plugin("slow", &log)
        };
        manager.install(descriptor(slow, &[])).unwrap();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), manager.load_plugin("slow")).await;
        assert!(cancelled.is_err());
        assert_eq!(manager.plugin_state("slow"), Some(PluginState::Error));
        assert_eq!(
            manager.plugin_metrics("slow").unwrap().last_error.as_deref(),
            Some("load cancelled")
        );
        assert_eq!(manager.registrations_of("slow").total(), 0);
        assert!(manager.registry().read().command("slow").is_none());

        manager.load_plugin("slow").await.unwrap();
        assert_eq!(manager.plugin_state("slow"), Some(PluginState::Loaded));
        manager.unload_plugin("slow").await.unwrap();
        assert_eq!(manager.plugin_state("slow"), Some(PluginState::Unloaded));
    }

    #[tokio::test]
    async fn test_plugin_load_sees_own_registrations() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager();
        let plugin = TestPlugin {
            ping: true,
            ..test_plugin("selfcall", &log)
        };
        manager.install(descriptor(plugin, &[])).unwrap();

        manager.load_plugin("selfcall").await.unwrap();
        assert_eq!(manager.plugin_state("selfcall"), Some(PluginState::Loaded));
        assert_eq!(*log.lock(), vec!["load:selfcall"]);
        assert_eq!(manager.registrations_of("selfcall").total(), 2);
    }
}
