//! Bounded result queue and its background consumer.
//!
//! Handlers produce [`ReplyResult`]s faster or slower than the outside world
//! can send them; the queue decouples the two. What happens when it is full is
//! decided by [`QueuePolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use coral_core::ReplyResult;

use super::metrics::BusMetrics;
use crate::error::BoxError;

/// Behaviour of a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// The producing publish call waits for space. No result is lost.
    #[default]
    Block,
    /// The new result is discarded and counted as dropped.
    DropNewest,
}

/// The external collaborator that actually sends results.
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError>;
}

/// What happened to one pushed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    Dropped,
}

// ============================================================================
// ResultQueue
// ============================================================================

pub(crate) struct ResultQueue {
    tx: mpsc::Sender<ReplyResult>,
    rx: Mutex<Option<mpsc::Receiver<ReplyResult>>>,
    capacity: usize,
    policy: QueuePolicy,
    metrics: Arc<BusMetrics>,
}

impl ResultQueue {
    pub(crate) fn new(capacity: usize, policy: QueuePolicy, metrics: Arc<BusMetrics>) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            policy,
            metrics,
        }
    }

    pub(crate) async fn push(&self, reply: ReplyResult) -> Enqueued {
        let outcome = match self.policy {
            QueuePolicy::Block => match self.tx.send(reply).await {
                Ok(()) => Enqueued::Queued,
                Err(_) => {
                    warn!("Result queue is closed, dropping result");
                    Enqueued::Dropped
                }
            },
            QueuePolicy::DropNewest => match self.tx.try_send(reply) {
                Ok(()) => Enqueued::Queued,
                Err(TrySendError::Full(_)) => {
                    warn!(capacity = self.capacity, "Result queue is full, dropping result");
                    Enqueued::Dropped
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Result queue is closed, dropping result");
                    Enqueued::Dropped
                }
            },
        };
        match outcome {
            Enqueued::Queued => self.metrics.observe_queue(self.len()),
            Enqueued::Dropped => self.metrics.record_dropped(),
        }
        outcome
    }

    /// Results waiting for the consumer.
    pub(crate) fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub(crate) fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Hands the receiving end to a consumer. Only succeeds once.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<ReplyResult>> {
        self.rx.lock().take()
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// A running consumer task.
pub(crate) struct Consumer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Consumer {
    pub(crate) fn spawn(
        rx: mpsc::Receiver<ReplyResult>,
        sink: Arc<dyn ReplySink>,
        metrics: Arc<BusMetrics>,
        batch_size: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consume(
            rx,
            sink,
            metrics,
            batch_size.max(1),
            cancel.clone(),
        ));
        Self { handle, cancel }
    }

    /// Stops accepting new results, delivers what is queued, and waits up to `drain_timeout`.
    pub(crate) async fn stop(self, drain_timeout: Duration) {
        self.cancel.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(())) => debug!("Result consumer stopped"),
            Ok(Err(e)) => error!(error = %e, "Result consumer task failed"),
            Err(_) => {
                warn!(timeout = ?drain_timeout, "Result consumer did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<ReplyResult>,
    sink: Arc<dyn ReplySink>,
    metrics: Arc<BusMetrics>,
    batch_size: usize,
    cancel: CancellationToken,
) {
    info!(batch_size, "Result consumer started");
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv_many(&mut batch, batch_size) => {
                if received == 0 {
                    debug!("Result queue closed");
                    return;
                }
                deliver_batch(&mut batch, sink.as_ref(), &metrics).await;
            }
        }
    }

    // Refuse new results, then flush whatever is already buffered.
    rx.close();
    while rx.recv_many(&mut batch, batch_size).await > 0 {
        deliver_batch(&mut batch, sink.as_ref(), &metrics).await;
    }
    info!("Result consumer drained");
}

async fn deliver_batch(batch: &mut Vec<ReplyResult>, sink: &dyn ReplySink, metrics: &BusMetrics) {
    for reply in batch.drain(..) {
        let started = Instant::now();
        match sink.deliver(reply).await {
            Ok(()) => metrics.record_result(started.elapsed()),
            Err(e) => {
                metrics.record_error();
                error!(error = %e, "Failed to deliver result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_core::{MessageRequest, ReplyResult};

    fn reply(text: &str) -> ReplyResult {
        MessageRequest::builder().message(text).build().into()
    }

    struct Collect(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ReplySink for Collect {
        async fn deliver(&self, reply: ReplyResult) -> Result<(), BoxError> {
            self.0.lock().push(reply.text().unwrap_or_default());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() {
        let metrics = Arc::new(BusMetrics::new());
        let queue = ResultQueue::new(2, QueuePolicy::DropNewest, metrics.clone());

        assert_eq!(queue.push(reply("a")).await, Enqueued::Queued);
        assert_eq!(queue.push(reply("b")).await, Enqueued::Queued);
        assert!(queue.is_full());
        assert_eq!(queue.push(reply("c")).await, Enqueued::Dropped);

        let snap = metrics.snapshot(queue.len(), queue.capacity());
        assert_eq!(snap.results_dropped, 1);
        assert_eq!(snap.queue_max, 2);
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let metrics = Arc::new(BusMetrics::new());
        let queue = Arc::new(ResultQueue::new(1, QueuePolicy::Block, metrics));
        let mut rx = queue.take_receiver().unwrap();

        queue.push(reply("first")).await;
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(reply("second")).await })
        };

        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        assert_eq!(rx.recv().await.and_then(|r| r.text()).as_deref(), Some("first"));
        assert_eq!(pusher.await.unwrap(), Enqueued::Queued);
        assert_eq!(rx.recv().await.and_then(|r| r.text()).as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_consumer_drains_on_stop() {
        let metrics = Arc::new(BusMetrics::new());
        let queue = ResultQueue::new(16, QueuePolicy::Block, metrics.clone());
        for text in ["a", "b", "c"] {
            queue.push(reply(text)).await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::spawn(
            queue.take_receiver().unwrap(),
            Arc::new(Collect(seen.clone())),
            metrics.clone(),
            2,
        );
        consumer.stop(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(metrics.snapshot(0, 16).results_processed, 3);
        assert!(queue.take_receiver().is_none());
    }
}
