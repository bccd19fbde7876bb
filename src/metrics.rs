//! Per-module processing statistics.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of most recent latency samples kept per module
const LATENCY_WINDOW: usize = 1000;

/// Sliding window of latency samples in nanoseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<u64>>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_nanos() as u64);
    }

    /// Latency at quantile `q` (0.0-1.0) in microseconds, 0 without samples
    pub fn quantile_us(&self, q: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * q.clamp(0.0, 1.0)).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Counters recorded by the worker loops of one module
#[derive(Debug, Clone)]
pub struct ModuleMetrics {
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    eos: Arc<AtomicU64>,
    /// Times a forward found a downstream conveyor full
    push_retries: Arc<AtomicU64>,
    latency: LatencyWindow,
    start_time: Instant,
}

impl ModuleMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            eos: Arc::new(AtomicU64::new(0)),
            push_retries: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(LATENCY_WINDOW),
            start_time: Instant::now(),
        }
    }

    /// Record a frame that went through `process` successfully
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eos(&self) {
        self.eos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_retry(&self) {
        self.push_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn eos(&self) -> u64 {
        self.eos.load(Ordering::Relaxed)
    }

    pub fn push_retries(&self) -> u64 {
        self.push_retries.load(Ordering::Relaxed)
    }

    /// Frames per second since the metrics were created
    pub fn throughput_fps(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.processed() as f64 / secs
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed(),
            failed: self.failed(),
            eos: self.eos(),
            push_retries: self.push_retries(),
            throughput_fps: self.throughput_fps(),
            latency_p50_us: self.latency.quantile_us(0.50),
            latency_p95_us: self.latency.quantile_us(0.95),
            latency_p99_us: self.latency.quantile_us(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for ModuleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a module's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub eos: u64,
    pub push_retries: u64,
    pub throughput_fps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed: {}, Failed: {}, EOS: {}, Push retries: {}, Throughput: {:.2} fps, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.processed,
            self.failed,
            self.eos,
            self.push_retries,
            self.throughput_fps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
