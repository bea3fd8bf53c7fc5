//! Per-stage runtime counters for threaded pipelines.
//!
//! Counters are updated by the stage's own runner thread and read from
//! anywhere through cheap clones of [`StageMetrics`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handler latencies kept per stage.
const LATENCY_WINDOW: usize = 1024;

/// Nearest-rank percentiles over the most recent handler latencies.
#[derive(Debug)]
pub struct LatencyWindow {
    nanos: Vec<u64>,
    /// Samples ever recorded; `recorded % capacity` is the next slot to overwrite.
    recorded: u64,
    capacity: usize,
}

impl LatencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            nanos: Vec::with_capacity(capacity),
            recorded: 0,
            capacity,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        if self.nanos.len() < self.capacity {
            self.nanos.push(nanos);
        } else {
            let slot = (self.recorded % self.capacity as u64) as usize;
            self.nanos[slot] = nanos;
        }
        self.recorded += 1;
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.nanos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nanos.is_empty()
    }

    pub fn summary(&self) -> LatencySummary {
        if self.nanos.is_empty() {
            return LatencySummary::default();
        }

        let mut sorted = self.nanos.clone();
        sorted.sort_unstable();
        let rank = |p: f64| {
            let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
            Duration::from_nanos(sorted[idx.min(sorted.len() - 1)])
        };

        LatencySummary {
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
            max: Duration::from_nanos(sorted[sorted.len() - 1]),
        }
    }
}

/// Latency percentiles of one stage's handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    waits: AtomicU64,
}

/// Shared handle to one stage's counters
#[derive(Debug, Clone)]
pub struct StageMetrics {
    counters: Arc<Counters>,
    latency: Arc<Mutex<LatencyWindow>>,
    started: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::default(),
            latency: Arc::new(Mutex::new(LatencyWindow::with_capacity(LATENCY_WINDOW))),
            started: Instant::now(),
        }
    }

    /// Count one handled event and its handler latency
    pub fn record_event(&self, latency: Duration, succeeded: bool) {
        let counter = if succeeded {
            &self.counters.processed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latency.lock().record(latency);
    }

    /// Add wait iterations spent before an event became ready
    pub fn record_waits(&self, iterations: u64) {
        if iterations > 0 {
            self.counters.waits.fetch_add(iterations, Ordering::Relaxed);
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn total_waits(&self) -> u64 {
        self.counters.waits.load(Ordering::Relaxed)
    }

    /// Events per second since creation, failures included
    pub fn throughput_eps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.total_processed() + self.total_failed()) as f64 / secs
        } else {
            0.0
        }
    }

    pub fn latency(&self) -> LatencySummary {
        self.latency.lock().summary()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_failed: self.total_failed(),
            total_waits: self.total_waits(),
            throughput_eps: self.throughput_eps(),
            latency: self.latency(),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stage's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_waits: u64,
    pub throughput_eps: f64,
    pub latency: LatencySummary,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} failed={} waits={} rate={:.0}/s p50={:?} p99={:?} max={:?} over {:.2}s",
            self.total_processed,
            self.total_failed,
            self.total_waits,
            self.throughput_eps,
            self.latency.p50,
            self.latency.p99,
            self.latency.max,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    #[test]
    fn test_empty_window() {
        let window = LatencyWindow::with_capacity(8);
        assert!(window.is_empty());
        assert_eq!(window.summary(), LatencySummary::default());
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = LatencyWindow::with_capacity(4);
        for n in [1000, 1, 2, 3, 4] {
            window.record(micros(n));
        }
        assert_eq!(window.len(), 4);

        let summary = window.summary();
        assert_eq!(summary.max, micros(4));
        assert_eq!(summary.p99, micros(4));
        assert_eq!(summary.p50, micros(2));
    }

    #[test]
    fn test_nearest_rank() {
        let mut window = LatencyWindow::with_capacity(100);
        for n in (1..=100).rev() {
            window.record(micros(n));
        }
        let summary = window.summary();
        assert_eq!(summary.p50, micros(50));
        assert_eq!(summary.p95, micros(95));
        assert_eq!(summary.p99, micros(99));
        assert_eq!(summary.max, micros(100));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = StageMetrics::new();
        let runner_side = metrics.clone();
        for i in 0..10 {
            runner_side.record_event(micros(5), i % 5 != 0);
        }
        runner_side.record_waits(0);
        runner_side.record_waits(12);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_processed, 8);
        assert_eq!(snapshot.total_failed, 2);
        assert_eq!(snapshot.total_waits, 12);
        assert_eq!(snapshot.latency.p50, micros(5));
        assert!(metrics.throughput_eps() > 0.0);
        assert!(snapshot
            .to_string()
            .starts_with("processed=8 failed=2 waits=12"));
    }
}
