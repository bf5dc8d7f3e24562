//! The event dispatch core.
//!
//! # Pipeline
//!
//! ```text
//! publish(event)
//!     │
//!     ▼
//! ┌────────────────────┐ None  ┌────────┐
//! │  middleware chain  │──────▶│ vetoed │
//! └────────────────────┘       └────────┘
//!     │ Some(event)
//!     ▼
//! ┌────────────────────┐
//! │ registry.matching  │  kind + filter, priority desc, registration asc
//! └────────────────────┘
//!     │
//!     ▼
//! handler 1 ─▶ handler 2 ─▶ … ─▶ handler N      (sequential, every one runs)
//!     │            │                 │
//!     └────────────┴──── replies ────┴──▶ result queue ──▶ consumer ──▶ ReplySink
//! ```
//!
//! Unrelated publish calls run concurrently; only the handlers within one
//! call are sequenced. A failing handler is logged and counted and never stops
//! its siblings.

mod metrics;
mod queue;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{Instrument, debug, debug_span, error, info};

use coral_core::{Event, EventKind};

use crate::error::{BoxError, BusError, HandlerTimeout};
use crate::handler::{BoxedHandler, HandlerResult, IntoReplies, handler_fn};
use crate::middleware::{ChainOutcome, Middleware, MiddlewareEntry, run_chain};
use crate::registry::{Registry, SharedRegistry};
use crate::subscription::{DEFAULT_PRIORITY, SubscribeOptions, Subscription, SubscriptionId};

pub use metrics::{BusMetrics, MetricsSnapshot};
pub use queue::{QueuePolicy, ReplySink};

use queue::{Consumer, Enqueued, ResultQueue};

// ============================================================================
// Configuration
// ============================================================================

/// Tuning knobs for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of undelivered results.
    pub queue_capacity: usize,
    /// Behaviour when the queue is full.
    pub queue_policy: QueuePolicy,
    /// Maximum results handed to the sink per consumer wake-up.
    pub batch_size: usize,
    /// How long `shutdown` waits for queued results to be delivered.
    pub drain_timeout: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Option<Duration>,
    /// Priority for subscriptions that do not specify one.
    pub default_priority: i32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            queue_policy: QueuePolicy::Block,
            batch_size: 10,
            drain_timeout: Duration::from_secs(1),
            handler_timeout: None,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// What one [`EventBus::publish`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A middleware step returned `None`; no handler ran.
    Vetoed { by: String },
    /// A middleware step failed; no handler ran.
    Rejected { by: String, error: String },
    /// The event reached its subscribers.
    Dispatched {
        /// Handlers invoked.
        handlers: usize,
        /// Handlers that returned an error, panicked or timed out.
        failed: usize,
        /// Results enqueued.
        replies: usize,
        /// Results discarded because the queue was full or closed.
        dropped: usize,
    },
}

impl PublishOutcome {
    pub fn is_vetoed(&self) -> bool {
        matches!(self, Self::Vetoed { .. })
    }

    /// Results enqueued by this call.
    pub fn replies(&self) -> usize {
        match self {
            Self::Dispatched { replies, .. } => *replies,
            _ => 0,
        }
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Publish/subscribe engine with a middleware chain and a bounded result queue.
///
/// # Example
///
/// ```rust,ignore
/// let bus = EventBus::new(BusConfig::default());
/// bus.on(EventKind::Message, |event: Arc<Event>| async move {
///     event.plain_text().map(|t| format!("you said: {t}"))
/// });
/// bus.start(Arc::new(my_sender))?;
/// bus.publish(message_event).await;
/// ```
pub struct EventBus {
    registry: SharedRegistry,
    middleware: RwLock<Vec<MiddlewareEntry>>,
    queue: ResultQueue,
    metrics: Arc<BusMetrics>,
    consumer: Mutex<Option<Consumer>>,
    config: BusConfig,
}

impl EventBus {
    /// Creates a bus with its own registry.
    pub fn new(config: BusConfig) -> Self {
        let registry = Registry::shared(config.default_priority);
        Self::with_registry(config, registry)
    }

    /// Creates a bus reading subscriptions from a shared registry.
    pub fn with_registry(config: BusConfig, registry: SharedRegistry) -> Self {
        let metrics = Arc::new(BusMetrics::new());
        let queue = ResultQueue::new(config.queue_capacity, config.queue_policy, metrics.clone());
        Self {
            registry,
            middleware: RwLock::new(Vec::new()),
            queue,
            metrics,
            consumer: Mutex::new(None),
            config,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    /// Subscribes `handler` to events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: BoxedHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = self.registry.write().subscribe(kind, handler, options);
        debug!(%kind, subscription = %id, "Subscribed handler");
        id
    }

    /// Subscribes an async closure with default options.
    pub fn on<F, Fut, R>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoReplies,
    {
        self.subscribe(kind, handler_fn(handler), SubscribeOptions::new())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.write().unsubscribe(id)
    }

    // ─── Middleware ─────────────────────────────────────────────────────────

    /// Appends a step to the middleware chain.
    pub fn add_middleware(&self, name: impl Into<String>, middleware: impl Middleware) {
        let name = name.into();
        debug!(middleware = %name, "Added middleware");
        self.middleware.write().push(MiddlewareEntry {
            name,
            middleware: Arc::new(middleware),
        });
    }

    /// Removes every middleware step with this name; returns how many went.
    pub fn remove_middleware(&self, name: &str) -> usize {
        let mut chain = self.middleware.write();
        let before = chain.len();
        chain.retain(|entry| entry.name != name);
        before - chain.len()
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.read().len()
    }

    // ─── Publishing ─────────────────────────────────────────────────────────

    /// Runs middleware and every matching handler for `event`.
    ///
    /// Returns once all handlers have finished and their results are
    /// enqueued, not when the results have been delivered.
    pub async fn publish(&self, event: impl Into<Event>) -> PublishOutcome {
        let event = event.into();
        let span = debug_span!("dispatch", kind = %event.kind(), event_id = %event.event_id());
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&self, event: Event) -> PublishOutcome {
        let started = Instant::now();

        let chain = self.middleware.read().clone();
        let event = match run_chain(&chain, event).await {
            ChainOutcome::Continue(event) => Arc::new(event),
            ChainOutcome::Vetoed { by } => {
                debug!(middleware = %by, "Event vetoed by middleware");
                self.metrics.record_veto();
                self.metrics.record_event(started.elapsed());
                return PublishOutcome::Vetoed { by };
            }
            ChainOutcome::Failed { by, error } => {
                error!(middleware = %by, error = %error, "Middleware failed, dropping event");
                self.metrics.record_error();
                self.metrics.record_event(started.elapsed());
                return PublishOutcome::Rejected {
                    by,
                    error: error.to_string(),
                };
            }
        };

        let subscribers = self.registry.read().matching(&event);
        let (mut failed, mut replies, mut dropped) = (0, 0, 0);

        for subscription in &subscribers {
            match self.invoke(subscription, event.clone()).await {
                Ok(results) => {
                    for result in results {
                        match self.queue.push(result).await {
                            Enqueued::Queued => replies += 1,
                            Enqueued::Dropped => dropped += 1,
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    self.metrics.record_error();
                    error!(handler = %subscription.label(), error = %e, "Handler returned an error");
                }
            }
        }

        self.metrics.record_event(started.elapsed());
        debug!(handlers = subscribers.len(), failed, replies, "Event dispatched");
        PublishOutcome::Dispatched {
            handlers: subscribers.len(),
            failed,
            replies,
            dropped,
        }
    }

    async fn invoke(&self, subscription: &Subscription, event: Arc<Event>) -> HandlerResult {
        let call = AssertUnwindSafe(subscription.handler().clone().oneshot(event)).catch_unwind();
        let outcome = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(HandlerTimeout {
                        handler: subscription.label().to_string(),
                        timeout: limit,
                    }
                    .into());
                }
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|_| Err(BoxError::from("handler panicked")))
    }

    // ─── Queue & consumer ───────────────────────────────────────────────────

    /// Starts the background consumer delivering results to `sink`.
    pub fn start(&self, sink: Arc<dyn ReplySink>) -> Result<(), BusError> {
        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            return Err(BusError::AlreadyStarted);
        }
        let rx = self.queue.take_receiver().ok_or(BusError::QueueUnavailable)?;
        *consumer = Some(Consumer::spawn(
            rx,
            sink,
            self.metrics.clone(),
            self.config.batch_size,
        ));
        info!(
            capacity = self.queue.capacity(),
            policy = ?self.queue.policy(),
            "Event bus started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.consumer.lock().is_some()
    }

    /// Stops the consumer after draining queued results. Safe to call twice.
    pub async fn shutdown(&self) {
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.stop(self.config.drain_timeout).await;
            info!("Event bus stopped");
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.queue.len(), self.queue.capacity())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("middleware", &self.middleware_count())
            .field("queue_size", &self.queue_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use coral_core::{MessageEvent, NoticeEvent, ReplyResult, UserInfo};

    use crate::middleware::middleware_fn;

    fn message(text: &str) -> MessageEvent {
        MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), text)
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<ReplyResult>>);

    #[async_trait]
    impl ReplySink for Collect {
        async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError> {
            self.0.lock().push(reply);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_only_non_empty_results_are_queued() {
        let bus = EventBus::new(BusConfig::default());
        bus.subscribe(
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async {}),
            SubscribeOptions::new().priority(10),
        );
        bus.subscribe(
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async { "hi" }),
            SubscribeOptions::new().priority(1),
        );
        let sink = Arc::new(Collect::default());
        bus.start(sink.clone()).unwrap();

        let outcome = bus.publish(message("hello")).await;
        bus.shutdown().await;

        assert_eq!(
            outcome,
            PublishOutcome::Dispatched { handlers: 2, failed: 0, replies: 1, dropped: 0 }
        );
        let delivered = sink.0.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text().as_deref(), Some("hi"));
        assert_eq!(bus.metrics().events_processed, 1);
        assert_eq!(bus.metrics().results_processed, 1);
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let bus = EventBus::new(BusConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("low", 1), ("high", 10), ("tie_a", 5), ("tie_b", 5)] {
            let order = order.clone();
            bus.subscribe(
                EventKind::Message,
                handler_fn(move |_e: Arc<Event>| {
                    let order = order.clone();
                    async move { order.lock().push(label) }
                }),
                SubscribeOptions::new().priority(priority),
            );
        }

        bus.publish(message("x")).await;
        assert_eq!(*order.lock(), vec!["high", "tie_a", "tie_b", "low"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_siblings() {
        let bus = EventBus::new(BusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async { Err::<(), _>("boom") }),
            SubscribeOptions::new().priority(10),
        );
        bus.subscribe(
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async {
                if true {
                    panic!("handler bug");
                }
            }),
            SubscribeOptions::new().priority(5),
        );
        {
            let calls = calls.clone();
            bus.on(EventKind::Message, move |_e: Arc<Event>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let outcome = bus.publish(message("x")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, PublishOutcome::Dispatched { handlers: 3, failed: 2, .. }));
        assert_eq!(bus.metrics().errors, 2);
    }

    #[tokio::test]
    async fn test_veto_skips_handlers_without_error() {
        let bus = EventBus::new(BusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            bus.on(EventKind::Message, move |_e: Arc<Event>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        bus.add_middleware(
            "mute",
            middleware_fn(|event: Event| async move {
                (event.plain_text().as_deref() != Some("spam")).then_some(event)
            }),
        );

        let vetoed = bus.publish(message("spam")).await;
        let passed = bus.publish(message("ham")).await;

        assert_eq!(vetoed, PublishOutcome::Vetoed { by: "mute".into() });
        assert!(!passed.is_vetoed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = bus.metrics();
        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.events_processed, 2);
        assert_eq!(metrics.events_vetoed, 1);
    }

    #[tokio::test]
    async fn test_middleware_transform_changes_matching() {
        let bus = EventBus::new(BusConfig::default());
        let notices = Arc::new(AtomicUsize::new(0));
        {
            let notices = notices.clone();
            bus.on(EventKind::Notice, move |_e: Arc<Event>| {
                let notices = notices.clone();
                async move {
                    notices.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        bus.add_middleware(
            "as_notice",
            middleware_fn(|_event: Event| async move {
                Some(NoticeEvent::new("console", "bot", "converted").into())
            }),
        );

        bus.publish(message("x")).await;
        assert_eq!(notices.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_counts_as_error() {
        let bus = EventBus::new(BusConfig {
            handler_timeout: Some(Duration::from_millis(50)),
            ..BusConfig::default()
        });
        bus.on(EventKind::Message, |_e: Arc<Event>| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        bus.on(EventKind::Message, |_e: Arc<Event>| async { "still here" });

        let outcome = bus.publish(message("x")).await;

        assert!(matches!(outcome, PublishOutcome::Dispatched { failed: 1, replies: 1, .. }));
        assert_eq!(bus.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_filters() {
        let bus = EventBus::new(BusConfig::default());
        let id = bus.on(EventKind::Message, |_e: Arc<Event>| async { "a" });
        bus.subscribe(
            EventKind::Message,
            handler_fn(|_e: Arc<Event>| async { "b" }),
            SubscribeOptions::new().filter(crate::subscription::filters::from_user("bob")),
        );

        assert!(bus.unsubscribe(id));
        let outcome = bus.publish(message("x")).await;
        assert_eq!(outcome.replies(), 0);
        assert_eq!(bus.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bus = EventBus::new(BusConfig::default());
        bus.start(Arc::new(Collect::default())).unwrap();
        assert!(matches!(
            bus.start(Arc::new(Collect::default())),
            Err(BusError::AlreadyStarted)
        ));
        bus.shutdown().await;
        bus.shutdown().await;
        assert!(!bus.is_running());
    }
}
