use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use extract::RunSummary;

pub struct Metrics {
    // Runs
    runs_started: AtomicUsize,
    runs_completed: AtomicUsize,
    runs_failed: AtomicUsize,

    // Documents
    documents_succeeded: AtomicUsize,
    documents_failed: AtomicUsize,

    // Oracle and quality
    oracle_calls: AtomicUsize,
    validation_warnings: AtomicUsize,
    over_connecting_alerts: AtomicUsize,
    under_connecting_alerts: AtomicUsize,
    narrow_confidence_alerts: AtomicUsize,

    // Timing (in microseconds)
    total_run_time_us: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs_started: AtomicUsize::new(0),
            runs_completed: AtomicUsize::new(0),
            runs_failed: AtomicUsize::new(0),
            documents_succeeded: AtomicUsize::new(0),
            documents_failed: AtomicUsize::new(0),
            oracle_calls: AtomicUsize::new(0),
            validation_warnings: AtomicUsize::new(0),
            over_connecting_alerts: AtomicUsize::new(0),
            under_connecting_alerts: AtomicUsize::new(0),
            narrow_confidence_alerts: AtomicUsize::new(0),
            total_run_time_us: AtomicU64::new(0),
        })
    }

    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A run that got through discovery, whatever happened to its documents
    pub fn record_run_completed(&self, summary: &RunSummary, duration: Duration) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.documents_succeeded
            .fetch_add(summary.succeeded.len(), Ordering::Relaxed);
        self.documents_failed
            .fetch_add(summary.failed.len(), Ordering::Relaxed);
        self.oracle_calls
            .fetch_add(summary.oracle_calls, Ordering::Relaxed);
        self.validation_warnings
            .fetch_add(summary.warnings, Ordering::Relaxed);
        self.over_connecting_alerts
            .fetch_add(summary.quality.over_connecting, Ordering::Relaxed);
        self.under_connecting_alerts
            .fetch_add(summary.quality.under_connecting, Ordering::Relaxed);
        self.narrow_confidence_alerts
            .fetch_add(summary.quality.narrow_confidence, Ordering::Relaxed);
        self.total_run_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_run_failed(&self, duration: Duration) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        self.total_run_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.runs_completed.load(Ordering::Relaxed) + self.runs_failed.load(Ordering::Relaxed);
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            documents_succeeded: self.documents_succeeded.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            oracle_calls: self.oracle_calls.load(Ordering::Relaxed),
            validation_warnings: self.validation_warnings.load(Ordering::Relaxed),
            over_connecting_alerts: self.over_connecting_alerts.load(Ordering::Relaxed),
            under_connecting_alerts: self.under_connecting_alerts.load(Ordering::Relaxed),
            narrow_confidence_alerts: self.narrow_confidence_alerts.load(Ordering::Relaxed),
            avg_run_time_ms: avg_time_ms(&self.total_run_time_us, finished),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: usize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    if count > 0 {
        total / count as f64 / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    pub oracle_calls: usize,
    pub validation_warnings: usize,
    pub over_connecting_alerts: usize,
    pub under_connecting_alerts: usize,
    pub narrow_confidence_alerts: usize,
    pub avg_run_time_ms: f64,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
