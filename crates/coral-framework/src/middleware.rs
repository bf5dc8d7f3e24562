//! Pre-dispatch middleware.
//!
//! Every published event passes through the middleware chain, in registration
//! order, before any handler sees it. Each step may pass the event on
//! (possibly replaced by a new value), veto it by returning `None`, or fail.
//! A veto is a deliberate short-circuit and is not counted as an error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use coral_core::Event;

use crate::error::BoxError;

/// A single transform/veto step.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Returns the (possibly replaced) event, or `None` to stop dispatch.
    async fn process(&self, event: Event) -> Result<Option<Event>, BoxError>;
}

/// Middleware backed by an async closure returning `Option<Event>`.
pub struct FnMiddleware<F>(F);

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Event>> + Send + 'static,
{
    async fn process(&self, event: Event) -> Result<Option<Event>, BoxError> {
        Ok((self.0)(event).await)
    }
}

/// Wraps an async closure into a [`Middleware`].
///
/// ```rust,ignore
/// bus.add_middleware("drop_bots", middleware_fn(|event: Event| async move {
///     match event.user() {
///         Some(user) if user.roles.iter().any(|r| r == "bot") => None,
///         _ => Some(event),
///     }
/// }));
/// ```
pub fn middleware_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Event>> + Send + 'static,
{
    FnMiddleware(f)
}

/// A named chain element.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub(crate) name: String,
    pub(crate) middleware: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of running the chain over one event.
pub(crate) enum ChainOutcome {
    /// Every step passed; dispatch the (possibly transformed) event.
    Continue(Event),
    /// The named step returned `None`.
    Vetoed { by: String },
    /// The named step failed or panicked.
    Failed { by: String, error: BoxError },
}

/// Runs `chain` over `event` in order, stopping at the first veto or failure.
pub(crate) async fn run_chain(chain: &[MiddlewareEntry], mut event: Event) -> ChainOutcome {
    for entry in chain {
        let step = AssertUnwindSafe(entry.middleware.process(event)).catch_unwind();
        match step.await {
            Ok(Ok(Some(next))) => event = next,
            Ok(Ok(None)) => {
                return ChainOutcome::Vetoed {
                    by: entry.name.clone(),
                };
            }
            Ok(Err(error)) => {
                return ChainOutcome::Failed {
                    by: entry.name.clone(),
                    error,
                };
            }
            Err(_) => {
                return ChainOutcome::Failed {
                    by: entry.name.clone(),
                    error: "middleware panicked".into(),
                };
            }
        }
    }
    ChainOutcome::Continue(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_core::{GenericEvent, MessageEvent, UserInfo};

    fn entry(name: &str, middleware: impl Middleware) -> MiddlewareEntry {
        MiddlewareEntry {
            name: name.to_string(),
            middleware: Arc::new(middleware),
        }
    }

    fn message(text: &str) -> Event {
        MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), text).into()
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        async fn process(&self, _event: Event) -> Result<Option<Event>, BoxError> {
            Err("store unavailable".into())
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_transform() {
        let chain = vec![
            entry(
                "to_generic",
                middleware_fn(|event: Event| async move {
                    let text = event.plain_text().unwrap_or_default();
                    Some(GenericEvent::new("console", "bot", "text", text.into()).into())
                }),
            ),
            entry(
                "check",
                middleware_fn(|event: Event| async move { event.as_generic().map(|_| event.clone()) }),
            ),
        ];

        match run_chain(&chain, message("hi")).await {
            ChainOutcome::Continue(event) => {
                let generic = event.as_generic().unwrap();
                assert_eq!(generic.data, serde_json::json!("hi"));
            }
            _ => panic!("expected the event to pass"),
        }
    }

    #[tokio::test]
    async fn test_veto_stops_chain() {
        let chain = vec![
            entry("veto", middleware_fn(|_event: Event| async move { None })),
            entry("never", Failing),
        ];

        match run_chain(&chain, message("hi")).await {
            ChainOutcome::Vetoed { by } => assert_eq!(by, "veto"),
            _ => panic!("expected a veto"),
        }
    }

    #[tokio::test]
    async fn test_failure_is_reported_with_name() {
        let chain = vec![entry("store", Failing)];

        match run_chain(&chain, message("hi")).await {
            ChainOutcome::Failed { by, error } => {
                assert_eq!(by, "store");
                assert_eq!(error.to_string(), "store unavailable");
            }
            _ => panic!("expected a failure"),
        }
    }
}
