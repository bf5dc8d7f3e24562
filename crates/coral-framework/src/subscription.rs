//! Subscriptions: which handler runs for which events, and in what order.
//!
//! Handlers run in descending priority; equal priorities run in registration
//! order. The registration sequence number doubles as the subscription id.

use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::sync::Arc;

use coral_core::{Event, EventKind};

use crate::handler::BoxedHandler;

/// Priority given to subscriptions that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Optional predicate evaluated before a handler is invoked.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Identifies a subscription for [`unsubscribe`](crate::EventBus::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    /// The registration sequence number.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// SubscribeOptions
// ============================================================================

/// Per-subscription settings.
///
/// # Example
///
/// ```rust,ignore
/// let opts = SubscribeOptions::new()
///     .priority(10)
///     .label("greeter")
///     .filter(filters::in_group("12345"));
/// ```
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub(crate) priority: Option<i32>,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) label: Option<String>,
    pub(crate) owner: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Name used in logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Plugin that owns the subscription; removed when the plugin unloads.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("filter", &self.filter.is_some())
            .field("label", &self.label)
            .field("owner", &self.owner)
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A registered handler.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) kind: EventKind,
    pub(crate) priority: i32,
    pub(crate) handler: BoxedHandler,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) label: String,
    pub(crate) owner: Option<String>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        kind: EventKind,
        handler: BoxedHandler,
        options: SubscribeOptions,
        default_priority: i32,
    ) -> Self {
        let label = options
            .label
            .unwrap_or_else(|| format!("{kind}{id}"));
        Self {
            id,
            kind,
            priority: options.priority.unwrap_or(default_priority),
            handler,
            filter: options.filter,
            label,
            owner: options.owner,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub(crate) fn handler(&self) -> &BoxedHandler {
        &self.handler
    }

    /// Whether this subscription wants `event`.
    pub fn accepts(&self, event: &Event) -> bool {
        self.kind == event.kind() && self.filter.as_ref().is_none_or(|filter| filter(event))
    }

    fn order_key(&self) -> (Reverse<i32>, SubscriptionId) {
        (Reverse(self.priority), self.id)
    }

    /// Dispatch order: higher priority first, then earlier registration.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("label", &self.label)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Common filters
// ============================================================================

/// Ready-made [`EventFilter`] predicates.
pub mod filters {
    use coral_core::Event;

    /// Generic events with the given name.
    pub fn generic_named(name: impl Into<String>) -> impl Fn(&Event) -> bool + Send + Sync + 'static {
        let name = name.into();
        move |event| event.as_generic().is_some_and(|g| g.name == name)
    }

    /// Events caused by the given user id.
    pub fn from_user(user_id: impl Into<String>) -> impl Fn(&Event) -> bool + Send + Sync + 'static {
        let user_id = user_id.into();
        move |event| event.user().is_some_and(|u| u.user_id == user_id)
    }

    /// Events that happened in the given group.
    pub fn in_group(group_id: impl Into<String>) -> impl Fn(&Event) -> bool + Send + Sync + 'static {
        let group_id = group_id.into();
        move |event| event.group().is_some_and(|g| g.group_id == group_id)
    }

    /// Events from one platform.
    pub fn on_platform(platform: impl Into<String>) -> impl Fn(&Event) -> bool + Send + Sync + 'static {
        let platform = platform.into();
        move |event| event.platform() == platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use coral_core::{GenericEvent, MessageEvent, UserInfo};

    fn sub(seq: u64, priority: i32) -> Subscription {
        Subscription::new(
            SubscriptionId(seq),
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async {}),
            SubscribeOptions::new().priority(priority),
            DEFAULT_PRIORITY,
        )
    }

    #[test]
    fn test_dispatch_order() {
        let mut subs = vec![sub(0, 1), sub(1, 10), sub(2, 5), sub(3, 10)];
        subs.sort_by(Subscription::dispatch_order);

        let ids: Vec<u64> = subs.iter().map(|s| s.id().seq()).collect();
        assert_eq!(ids, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_accepts_checks_kind_and_filter() {
        let generic: Event = GenericEvent::new("console", "bot", "tick", serde_json::Value::Null).into();
        let message: Event =
            MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), "hi").into();

        let s = Subscription::new(
            SubscriptionId(0),
            EventKind::Generic,
            handler_fn(|_e: Arc<Event>| async {}),
            SubscribeOptions::new().filter(filters::generic_named("tick")),
            DEFAULT_PRIORITY,
        );

        assert!(s.accepts(&generic));
        assert!(!s.accepts(&message));
        assert_eq!(s.priority(), DEFAULT_PRIORITY);
        assert_eq!(s.label(), "generic#0");
    }
}
