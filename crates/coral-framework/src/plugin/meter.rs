//! Per-plugin call metering.
//!
//! Every handler a plugin registers is wrapped in [`MeterLayer`] so the
//! plugin's record sees its call count, execution time and errors.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tower::Service;
use tower_layer::Layer;

use coral_core::Event;

use crate::error::BoxError;

use super::record::SharedPluginMetrics;

/// A tower [`Layer`] that records calls into a plugin's metrics.
#[derive(Clone)]
pub struct MeterLayer {
    metrics: SharedPluginMetrics,
}

impl MeterLayer {
    pub fn new(metrics: SharedPluginMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MeterLayer {
    type Service = Metered<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Metered {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

/// Service produced by [`MeterLayer`].
#[derive(Clone)]
pub struct Metered<S> {
    inner: S,
    metrics: SharedPluginMetrics,
}

impl<S> Service<Arc<Event>> for Metered<S>
where
    S: Service<Arc<Event>, Error = BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, event: Arc<Event>) -> Self::Future {
        let metrics = Arc::clone(&self.metrics);
        let fut = self.inner.call(event);
        async move {
            let started = Instant::now();
            let result = fut.await;
            let mut metrics = metrics.lock();
            metrics.record_call(started.elapsed(), result.is_err());
            if let Err(e) = &result {
                metrics.last_error = Some(e.to_string());
            }
            result
        }
        .boxed()
    }
}
