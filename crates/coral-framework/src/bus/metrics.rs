//! Event bus metrics.
//!
//! Counters are plain atomics; each running average sits behind its own
//! mutex so its count and mean always move together.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy)]
struct RunningAverage {
    count: u64,
    mean_secs: f64,
}

impl RunningAverage {
    fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.mean_secs += (sample.as_secs_f64() - self.mean_secs) / self.count as f64;
    }

    fn mean(&self) -> Duration {
        Duration::try_from_secs_f64(self.mean_secs).unwrap_or_default()
    }
}

/// Live metrics shared by the bus and its result consumer.
#[derive(Debug, Default)]
pub struct BusMetrics {
    events_processed: AtomicU64,
    events_vetoed: AtomicU64,
    results_processed: AtomicU64,
    results_dropped: AtomicU64,
    errors: AtomicU64,
    event_time: Mutex<RunningAverage>,
    result_time: Mutex<RunningAverage>,
    queue_max: AtomicUsize,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One publish call finished (vetoed or not).
    pub(crate) fn record_event(&self, elapsed: Duration) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.event_time.lock().record(elapsed);
    }

    pub(crate) fn record_veto(&self) {
        self.events_vetoed.fetch_add(1, Ordering::Relaxed);
    }

    /// One result was handed to the sink successfully.
    pub(crate) fn record_result(&self, elapsed: Duration) {
        self.results_processed.fetch_add(1, Ordering::Relaxed);
        self.result_time.lock().record(elapsed);
    }

    pub(crate) fn record_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Raises the queue high-water mark if `occupancy` exceeds it.
    pub(crate) fn observe_queue(&self, occupancy: usize) {
        self.queue_max.fetch_max(occupancy, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy, completed with the queue's current state.
    pub fn snapshot(&self, queue_current: usize, queue_capacity: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_vetoed: self.events_vetoed.load(Ordering::Relaxed),
            results_processed: self.results_processed.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_event_time: self.event_time.lock().mean(),
            avg_result_time: self.result_time.lock().mean(),
            queue_current,
            queue_max: self.queue_max.load(Ordering::Relaxed).max(queue_current),
            queue_capacity,
        }
    }
}

/// Metrics read by operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_vetoed: u64,
    pub results_processed: u64,
    pub results_dropped: u64,
    pub errors: u64,
    pub avg_event_time: Duration,
    pub avg_result_time: Duration,
    pub queue_current: usize,
    pub queue_max: usize,
    pub queue_capacity: usize,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Event Bus Metrics")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(
            f,
            "Events: {} processed, {} vetoed",
            self.events_processed, self.events_vetoed
        )?;
        writeln!(
            f,
            "Results: {} processed, {} dropped",
            self.results_processed, self.results_dropped
        )?;
        writeln!(f, "Errors: {}", self.errors)?;
        writeln!(
            f,
            "Avg event time: {:.3}ms, avg result time: {:.3}ms",
            self.avg_event_time.as_secs_f64() * 1000.0,
            self.avg_result_time.as_secs_f64() * 1000.0
        )?;
        write!(
            f,
            "Queue: {}/{} (max {})",
            self.queue_current, self.queue_capacity, self.queue_max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let metrics = BusMetrics::new();
        metrics.record_event(Duration::from_millis(10));
        metrics.record_event(Duration::from_millis(30));

        let snap = metrics.snapshot(0, 100);
        assert_eq!(snap.events_processed, 2);
        let avg_ms = snap.avg_event_time.as_secs_f64() * 1000.0;
        assert!((avg_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_queue_high_water_mark() {
        let metrics = BusMetrics::new();
        metrics.observe_queue(3);
        metrics.observe_queue(1);

        assert_eq!(metrics.snapshot(1, 10).queue_max, 3);
        assert_eq!(metrics.snapshot(7, 10).queue_max, 7);
    }

    #[test]
    fn test_display() {
        let text = BusMetrics::new().snapshot(0, 1000).to_string();
        assert!(text.contains("Queue: 0/1000 (max 0)"));
    }
}
