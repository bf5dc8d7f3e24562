//! The shared registry read by the dispatch core and written by the loader.
//!
//! Three name-keyed tables live here:
//!
//! - **subscriptions** per [`EventKind`], kept in dispatch order
//! - **commands**, routed by the built-in command router
//! - **functions**, callable across plugins with JSON arguments
//!
//! Every entry may carry an owning plugin name so the loader can remove a
//! plugin's registrations in one step. The registry sits behind a
//! [`SharedRegistry`] lock; writers hold it for a whole plugin's
//! [`commit`](Registry::commit) or [`remove_owner`](Registry::remove_owner),
//! so dispatch never observes a half-registered plugin. Readers never hold it
//! across an await point.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use coral_core::{Event, EventKind};

use crate::error::{BoxError, RegistryError};
use crate::handler::BoxedHandler;
use crate::subscription::{DEFAULT_PRIORITY, SubscribeOptions, Subscription, SubscriptionId};

/// The registry as shared between the bus, the loader and the command router.
pub type SharedRegistry = Arc<RwLock<Registry>>;

/// A cross-plugin callable taking and returning JSON.
pub type BoxedFunction = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`BoxedFunction`].
pub fn function_fn<F, Fut>(f: F) -> BoxedFunction
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

// ============================================================================
// Entries
// ============================================================================

/// A named command and the handler that serves it.
#[derive(Clone)]
pub struct CommandEntry {
    pub(crate) name: String,
    pub(crate) handler: BoxedHandler,
    pub(crate) permission: Option<String>,
    pub(crate) description: String,
    pub(crate) owner: Option<String>,
}

impl CommandEntry {
    pub fn new(name: impl Into<String>, handler: BoxedHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            permission: None,
            description: String::new(),
            owner: None,
        }
    }

    /// Permission name checked before the handler runs.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required_permission(&self) -> Option<&str> {
        self.permission.as_deref()
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn owned_by(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// A named cross-plugin function.
#[derive(Clone)]
pub struct FunctionEntry {
    pub(crate) name: String,
    pub(crate) func: BoxedFunction,
    pub(crate) owner: Option<String>,
}

impl FunctionEntry {
    pub fn new(name: impl Into<String>, func: BoxedFunction) -> Self {
        Self {
            name: name.into(),
            func,
            owner: None,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// A subscription staged for a later [`Registry::commit`].
#[derive(Clone)]
pub struct PendingSubscription {
    pub(crate) kind: EventKind,
    pub(crate) handler: BoxedHandler,
    pub(crate) options: SubscribeOptions,
}

/// Everything one plugin registers, staged so it can be applied atomically.
#[derive(Clone, Default)]
pub struct Registrations {
    pub(crate) subscriptions: Vec<PendingSubscription>,
    pub(crate) commands: Vec<CommandEntry>,
    pub(crate) functions: Vec<FunctionEntry>,
}

impl Registrations {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.commands.is_empty() && self.functions.is_empty()
    }
}

/// Names of everything registered by one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnedRegistrations {
    /// `(kind, label, priority)` in dispatch order per kind.
    pub subscriptions: Vec<(EventKind, String, i32)>,
    pub commands: Vec<String>,
    pub functions: Vec<String>,
}

impl OwnedRegistrations {
    pub fn total(&self) -> usize {
        self.subscriptions.len() + self.commands.len() + self.functions.len()
    }
}

/// Table sizes, for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub subscriptions: usize,
    pub commands: usize,
    pub functions: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry: {} subscriptions, {} commands, {} functions",
            self.subscriptions, self.commands, self.functions
        )
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Subscription, command and function tables.
pub struct Registry {
    subscriptions: HashMap<EventKind, Vec<Subscription>>,
    commands: BTreeMap<String, CommandEntry>,
    functions: BTreeMap<String, FunctionEntry>,
    next_seq: u64,
    default_priority: i32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY)
    }
}

impl Registry {
    /// Creates an empty registry; subscriptions without a priority get `default_priority`.
    pub fn new(default_priority: i32) -> Self {
        Self {
            subscriptions: HashMap::new(),
            commands: BTreeMap::new(),
            functions: BTreeMap::new(),
            next_seq: 0,
            default_priority,
        }
    }

    /// Wraps a fresh registry for sharing.
    pub fn shared(default_priority: i32) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(default_priority)))
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    /// Adds a subscription and returns its id.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        handler: BoxedHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_seq);
        self.next_seq += 1;
        let subscription = Subscription::new(id, kind, handler, options, self.default_priority);

        let list = self.subscriptions.entry(kind).or_default();
        // Ids grow monotonically, so the insertion point keeps ties in registration order.
        let at = list.partition_point(|s| s.dispatch_order(&subscription).is_lt());
        list.insert(at, subscription);
        id
    }

    /// Removes a subscription; returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for list in self.subscriptions.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Subscriptions accepting `event`, in dispatch order.
    pub fn matching(&self, event: &Event) -> Vec<Subscription> {
        self.subscriptions
            .get(&event.kind())
            .map(|list| list.iter().filter(|s| s.accepts(event)).cloned().collect())
            .unwrap_or_default()
    }

    /// All subscriptions for `kind`, in dispatch order.
    pub fn subscriptions(&self, kind: EventKind) -> &[Subscription] {
        self.subscriptions.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    pub fn register_command(&mut self, entry: CommandEntry) -> Result<(), RegistryError> {
        if let Some(existing) = self.commands.get(&entry.name) {
            return Err(RegistryError::DuplicateCommand {
                name: entry.name,
                owner: RegistryError::owner_label(existing.owner.as_deref()),
            });
        }
        self.commands.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn unregister_command(&mut self, name: &str) -> Option<CommandEntry> {
        self.commands.remove(name)
    }

    pub fn command(&self, name: &str) -> Option<&CommandEntry> {
        self.commands.get(name)
    }

    /// All commands, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &CommandEntry> {
        self.commands.values()
    }

    // ─── Functions ──────────────────────────────────────────────────────────

    pub fn register_function(&mut self, entry: FunctionEntry) -> Result<(), RegistryError> {
        if let Some(existing) = self.functions.get(&entry.name) {
            return Err(RegistryError::DuplicateFunction {
                name: entry.name,
                owner: RegistryError::owner_label(existing.owner.as_deref()),
            });
        }
        self.functions.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn unregister_function(&mut self, name: &str) -> Option<FunctionEntry> {
        self.functions.remove(name)
    }

    /// A callable handle; invoke it after releasing the registry lock.
    pub fn function(&self, name: &str) -> Option<BoxedFunction> {
        self.functions.get(name).map(|entry| entry.func.clone())
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    // ─── Bulk operations ────────────────────────────────────────────────────

    /// Applies one owner's staged registrations, all or nothing.
    ///
    /// Command and function names are checked against the registry and
    /// against each other before anything is inserted.
    pub fn commit(
        &mut self,
        owner: &str,
        registrations: Registrations,
    ) -> Result<Vec<SubscriptionId>, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &registrations.commands {
            if let Some(existing) = self.commands.get(&entry.name) {
                return Err(RegistryError::DuplicateCommand {
                    name: entry.name.clone(),
                    owner: RegistryError::owner_label(existing.owner.as_deref()),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(RegistryError::DuplicateCommand {
                    name: entry.name.clone(),
                    owner: owner.to_string(),
                });
            }
        }
        seen.clear();
        for entry in &registrations.functions {
            if let Some(existing) = self.functions.get(&entry.name) {
                return Err(RegistryError::DuplicateFunction {
                    name: entry.name.clone(),
                    owner: RegistryError::owner_label(existing.owner.as_deref()),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(RegistryError::DuplicateFunction {
                    name: entry.name.clone(),
                    owner: owner.to_string(),
                });
            }
        }

        let ids = registrations
            .subscriptions
            .into_iter()
            .map(|pending| {
                self.subscribe(pending.kind, pending.handler, pending.options.owner(owner))
            })
            .collect();
        for entry in registrations.commands {
            self.commands.insert(entry.name.clone(), entry.owner(owner));
        }
        for entry in registrations.functions {
            self.functions.insert(entry.name.clone(), entry.owner(owner));
        }
        Ok(ids)
    }

    /// Removes everything registered by `owner`; returns how many entries went.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        for list in self.subscriptions.values_mut() {
            let before = list.len();
            list.retain(|s| s.owner.as_deref() != Some(owner));
            removed += before - list.len();
        }

        let before = self.commands.len();
        self.commands.retain(|_, c| c.owner.as_deref() != Some(owner));
        removed += before - self.commands.len();

        let before = self.functions.len();
        self.functions.retain(|_, f| f.owner.as_deref() != Some(owner));
        removed += before - self.functions.len();

        removed
    }

    /// Names of everything `owner` has registered.
    pub fn owned_by(&self, owner: &str) -> OwnedRegistrations {
        let mut owned = OwnedRegistrations::default();
        for kind in EventKind::ALL {
            for s in self.subscriptions(kind) {
                if s.owner.as_deref() == Some(owner) {
                    owned.subscriptions.push((kind, s.label.clone(), s.priority));
                }
            }
        }
        owned.commands = self
            .commands
            .values()
            .filter(|c| c.owner.as_deref() == Some(owner))
            .map(|c| c.name.clone())
            .collect();
        owned.functions = self
            .functions
            .values()
            .filter(|f| f.owner.as_deref() == Some(owner))
            .map(|f| f.name.clone())
            .collect();
        owned
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            subscriptions: self.subscriptions.values().map(Vec::len).sum(),
            commands: self.commands.len(),
            functions: self.functions.len(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Calls a registered function without holding the registry lock while it runs.
pub async fn call_function(
    registry: &SharedRegistry,
    name: &str,
    args: Value,
) -> Result<Value, RegistryError> {
    let func = registry
        .read()
        .function(name)
        .ok_or_else(|| RegistryError::FunctionNotFound(name.to_string()))?;
    func(args).await.map_err(|e| RegistryError::FunctionFailed {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
