//! Validator Metrics
//!
//! Lightweight counters for machine builds and validation runs.
//!
//! # Design Goals:
//! - Lock-free atomic counters, safe to bump from worker threads
//! - Zero allocation on the hot path
//! - Point-in-time snapshots for reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters shared by the loader and both spawners.
#[derive(Default)]
pub struct ValidatorMetrics {
    // Machine loader
    pub machine_builds: AtomicU64,
    pub machine_build_time_ns: AtomicU64,
    pub build_failures: AtomicU64,

    // Validation runs
    pub runs_launched: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub run_time_ns: AtomicU64,

    // Worker pool
    pub worker_panics: AtomicU64,
}

impl ValidatorMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_machine_build(&self, duration: Duration, success: bool) {
        self.machine_builds.fetch_add(1, Ordering::Relaxed);
        self.machine_build_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        if !success {
            self.build_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_run_launched(&self) {
        self.runs_launched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished run and classify its outcome.
    pub fn record_run_outcome<T>(&self, duration: Duration, outcome: &crate::Result<T>) {
        self.run_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        let counter = match outcome {
            Ok(_) => &self.runs_succeeded,
            Err(e) if e.is_cancelled() => &self.runs_cancelled,
            Err(_) => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.runs_succeeded.load(Ordering::Relaxed)
            + self.runs_failed.load(Ordering::Relaxed)
            + self.runs_cancelled.load(Ordering::Relaxed);
        MetricsSnapshot {
            machine_builds: self.machine_builds.load(Ordering::Relaxed),
            avg_machine_build_ms: avg_ms(
                self.machine_builds.load(Ordering::Relaxed),
                self.machine_build_time_ns.load(Ordering::Relaxed),
            ),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            runs_launched: self.runs_launched.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            avg_run_ms: avg_ms(finished, self.run_time_ns.load(Ordering::Relaxed)),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
        }
    }
}

fn avg_ms(count: u64, total_ns: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (total_ns as f64) / (count as f64) / 1_000_000.0
}

/// A point-in-time snapshot of [`ValidatorMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub machine_builds: u64,
    pub avg_machine_build_ms: f64,
    pub build_failures: u64,
    pub runs_launched: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub avg_run_ms: f64,
    pub worker_panics: u64,
}

impl MetricsSnapshot {
    /// Print a human-readable report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║         Validator Metrics Report                          ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Machine Loader                                            ║");
        println!("║   Builds:      {:>8} (avg: {:>8.3} ms)              ║",
                 self.machine_builds, self.avg_machine_build_ms);
        println!("║   Failures:    {:>8}                                   ║",
                 self.build_failures);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Validation Runs                                           ║");
        println!("║   Launched:    {:>8} (avg: {:>8.3} ms)              ║",
                 self.runs_launched, self.avg_run_ms);
        println!("║   Succeeded:   {:>8}                                   ║",
                 self.runs_succeeded);
        println!("║   Failed:      {:>8}                                   ║",
                 self.runs_failed);
        println!("║   Cancelled:   {:>8}                                   ║",
                 self.runs_cancelled);
        println!("║   Panics:      {:>8}                                   ║",
                 self.worker_panics);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// Records the elapsed time of a machine build on drop.
pub struct BuildTimer<'a> {
    start: Instant,
    metrics: &'a ValidatorMetrics,
    success: bool,
}

impl<'a> BuildTimer<'a> {
    pub fn new(metrics: &'a ValidatorMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            success: false,
        }
    }

    pub fn succeeded(&mut self) {
        self.success = true;
    }
}

impl Drop for BuildTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_machine_build(self.start.elapsed(), self.success);
    }
}
