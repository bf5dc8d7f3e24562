//! Handler system for the Coral framework.
//!
//! A handler is anything that turns an `Arc<Event>` into zero or more
//! [`ReplyResult`]s. Internally every handler is a `tower::Service`, erased to
//! a [`BoxedHandler`] so subscriptions, commands and per-plugin layers can
//! share one representation.
//!
//! Most handlers are plain async closures wrapped with [`handler_fn`]:
//!
//! ```rust,ignore
//! use coral_framework::handler_fn;
//!
//! let echo = handler_fn(|event: Arc<Event>| async move {
//!     event.plain_text()
//! });
//! ```
//!
//! The closure may return anything implementing [`IntoReplies`]: `()`,
//! strings, [`MessageRequest`], [`ActionRequest`], [`ReplyResult`], and
//! `Option`, `Vec` or `Result` wrappers around those.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::Service;
use tower::util::BoxCloneSyncService;
use tracing::trace;

use coral_core::{ActionRequest, Event, MessageChain, MessageRequest, ReplyResult};

use crate::error::BoxError;

/// A type-erased, cloneable handler service.
pub type BoxedHandler = BoxCloneSyncService<Arc<Event>, Vec<ReplyResult>, BoxError>;

/// What a handler invocation produces.
pub type HandlerResult = Result<Vec<ReplyResult>, BoxError>;

// ============================================================================
// IntoReplies
// ============================================================================

/// Normalises a handler's return value into outgoing replies.
///
/// The triggering event is supplied so bare text can be addressed back to
/// its sender.
pub trait IntoReplies: Send + 'static {
    fn into_replies(self, event: &Event) -> HandlerResult;
}

/// No reply.
impl IntoReplies for () {
    fn into_replies(self, _event: &Event) -> HandlerResult {
        Ok(Vec::new())
    }
}

/// Text is sent back to wherever the event came from.
impl IntoReplies for String {
    fn into_replies(self, event: &Event) -> HandlerResult {
        trace!(event_id = %event.event_id(), "Converting text reply to a message request");
        Ok(vec![MessageRequest::reply_to(event, self).into()])
    }
}

impl IntoReplies for &'static str {
    fn into_replies(self, event: &Event) -> HandlerResult {
        self.to_string().into_replies(event)
    }
}

impl IntoReplies for MessageChain {
    fn into_replies(self, event: &Event) -> HandlerResult {
        Ok(vec![MessageRequest::reply_to(event, self).into()])
    }
}

impl IntoReplies for MessageRequest {
    fn into_replies(self, _event: &Event) -> HandlerResult {
        Ok(vec![self.into()])
    }
}

impl IntoReplies for ActionRequest {
    fn into_replies(self, _event: &Event) -> HandlerResult {
        Ok(vec![self.into()])
    }
}

impl IntoReplies for ReplyResult {
    fn into_replies(self, _event: &Event) -> HandlerResult {
        Ok(vec![self])
    }
}

/// `None` yields no replies.
impl<T: IntoReplies> IntoReplies for Option<T> {
    fn into_replies(self, event: &Event) -> HandlerResult {
        match self {
            Some(inner) => inner.into_replies(event),
            None => Ok(Vec::new()),
        }
    }
}

/// One reply per element, in order.
impl<T: IntoReplies> IntoReplies for Vec<T> {
    fn into_replies(self, event: &Event) -> HandlerResult {
        let mut replies = Vec::with_capacity(self.len());
        for item in self {
            replies.extend(item.into_replies(event)?);
        }
        Ok(replies)
    }
}

/// `Err` becomes a handler error, counted by the bus.
impl<T, E> IntoReplies for Result<T, E>
where
    T: IntoReplies,
    E: Into<BoxError> + Send + 'static,
{
    fn into_replies(self, event: &Event) -> HandlerResult {
        match self {
            Ok(inner) => inner.into_replies(event),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// HandlerService
// ============================================================================

/// A tower [`Service`] that calls an async closure and normalises its output.
pub struct HandlerService<F, R> {
    handler: F,
    _marker: PhantomData<fn() -> R>,
}

impl<F, R> HandlerService<F, R> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<F: Clone, R> Clone for HandlerService<F, R> {
    fn clone(&self) -> Self {
        Self::new(self.handler.clone())
    }
}

impl<F, Fut, R> Service<Arc<Event>> for HandlerService<F, R>
where
    F: Fn(Arc<Event>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReplies,
{
    type Response = Vec<ReplyResult>;
    type Error = BoxError;
    type Future = BoxFuture<'static, HandlerResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<Event>) -> Self::Future {
        let fut = (self.handler)(event.clone());
        async move { fut.await.into_replies(&event) }.boxed()
    }
}

/// Wraps an async closure into a [`BoxedHandler`].
pub fn handler_fn<F, Fut, R>(handler: F) -> BoxedHandler
where
    F: Fn(Arc<Event>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReplies,
{
    BoxCloneSyncService::new(HandlerService::<F, R>::new(handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_core::{MessageEvent, UserInfo};
    use tower::ServiceExt;

    fn event() -> Arc<Event> {
        Arc::new(MessageEvent::new("console", "bot", UserInfo::new("console", "alice"), "hi").into())
    }

    #[test]
    fn test_normalisation_counts() {
        let e = event();
        assert_eq!(().into_replies(&e).unwrap().len(), 0);
        assert_eq!(None::<String>.into_replies(&e).unwrap().len(), 0);
        assert_eq!("one".into_replies(&e).unwrap().len(), 1);
        assert_eq!(vec!["a", "b", "c"].into_replies(&e).unwrap().len(), 3);
        assert_eq!(Some(vec!["a".to_string()]).into_replies(&e).unwrap().len(), 1);
    }

    #[test]
    fn test_result_err_becomes_handler_error() {
        let e = event();
        let result: Result<String, std::io::Error> = Err(std::io::Error::other("boom"));
        let err = result.into_replies(&e).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_handler_fn_addresses_text_replies() {
        let handler = handler_fn(|event: Arc<Event>| async move {
            event.plain_text().map(|text| format!("echo: {text}"))
        });

        let e = event();
        let replies = handler.oneshot(e.clone()).await.unwrap();

        assert_eq!(replies.len(), 1);
        let request = replies[0].as_message().unwrap();
        assert_eq!(request.event_id, e.event_id());
        assert_eq!(request.message.plain_text(), "echo: hi");
    }
}
