//! Runtime metrics and instrumentation.
//!
//! Every store operation emits a `tracing` span (names in [`spans`]). This
//! module adds lightweight counters and a latency monitor that can be
//! queried at runtime or exported in Prometheus text format.
//!
//! Counters are lock-free `AtomicU64`s. The latency ring uses a
//! `parking_lot::Mutex`, taken once per retrieval and on export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Counters (lock-free)
// ---------------------------------------------------------------------------

/// Atomic counters for store operations.
#[derive(Debug)]
pub struct StoreCounters {
    /// Memories stored.
    pub stores: AtomicU64,
    /// Retrieval calls served.
    pub retrievals: AtomicU64,
    /// Records returned across all retrieval pages.
    pub records_returned: AtomicU64,
    /// Update calls applied.
    pub updates: AtomicU64,
    /// Delete calls applied.
    pub deletes: AtomicU64,
    /// Records folded away by consolidation.
    pub folds: AtomicU64,
    /// Sessions created.
    pub sessions_created: AtomicU64,
    /// Calls that returned an error.
    pub failures: AtomicU64,
}

impl StoreCounters {
    /// Create a new set of zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stores: AtomicU64::new(0),
            retrievals: AtomicU64::new(0),
            records_returned: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            folds: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Add `n` to `counter`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            stores: self.stores.load(Ordering::Relaxed),
            retrievals: self.retrievals.load(Ordering::Relaxed),
            records_returned: self.records_returned.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            folds: self.folds.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for StoreCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of counter values at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Memories stored.
    pub stores: u64,
    /// Retrieval calls served.
    pub retrievals: u64,
    /// Records returned across all retrieval pages.
    pub records_returned: u64,
    /// Update calls applied.
    pub updates: u64,
    /// Delete calls applied.
    pub deletes: u64,
    /// Records folded away by consolidation.
    pub folds: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Calls that returned an error.
    pub failures: u64,
}

impl CounterSnapshot {
    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let rows = [
            ("stores", "Memories stored", self.stores),
            ("retrievals", "Retrieval calls served", self.retrievals),
            ("records_returned", "Records returned in retrieval pages", self.records_returned),
            ("updates", "Update calls applied", self.updates),
            ("deletes", "Delete calls applied", self.deletes),
            ("folds", "Records folded by consolidation", self.folds),
            ("sessions_created", "Sessions created", self.sessions_created),
            ("failures", "Calls that returned an error", self.failures),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP ctxmem_{name}_total {help}\n\
                 # TYPE ctxmem_{name}_total counter\n\
                 ctxmem_{name}_total {value}\n"
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Latency Monitor
// ---------------------------------------------------------------------------

const LATENCY_WINDOW: usize = 256;

/// Tracks recent operation latencies against a soft budget.
#[derive(Debug)]
pub struct LatencyMonitor {
    budget_ms: f64,
    history: Mutex<LatencyHistory>,
}

#[derive(Debug)]
struct LatencyHistory {
    /// Ring buffer of recent timings (milliseconds).
    timings: Vec<f64>,
    write_idx: usize,
    count: u64,
}

impl LatencyMonitor {
    /// Create a monitor with the given budget (milliseconds).
    #[must_use]
    pub fn new(budget_ms: f64) -> Self {
        Self {
            budget_ms,
            history: Mutex::new(LatencyHistory {
                timings: vec![0.0; LATENCY_WINDOW],
                write_idx: 0,
                count: 0,
            }),
        }
    }

    /// Record one operation's duration. Returns whether it exceeded the budget.
    pub fn record(&self, took: Duration) -> bool {
        let ms = took.as_secs_f64() * 1000.0;
        let mut h = self.history.lock();
        let idx = h.write_idx;
        let len = h.timings.len();
        h.timings[idx] = ms;
        h.write_idx = (idx + 1) % len;
        h.count += 1;
        ms > self.budget_ms
    }

    /// Number of operations recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.history.lock().count
    }

    /// The configured budget in milliseconds.
    #[must_use]
    pub fn budget_ms(&self) -> f64 {
        self.budget_ms
    }

    /// P50, P95, P99, and max over the recorded window (milliseconds).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn percentiles(&self) -> LatencyPercentiles {
        let h = self.history.lock();
        let n = usize::try_from(h.count).map_or(h.timings.len(), |c| c.min(h.timings.len()));
        if n == 0 {
            return LatencyPercentiles::default();
        }

        let mut sorted = h.timings[..n].to_vec();
        sorted.sort_by(f64::total_cmp);

        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        let over = sorted.iter().filter(|&&t| t > self.budget_ms).count();
        LatencyPercentiles {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: sorted[n - 1],
            over_budget_ratio: over as f64 / n as f64,
        }
    }
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new(5.0)
    }
}

/// Percentile statistics for recorded latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyPercentiles {
    /// 50th percentile (median) in milliseconds.
    pub p50: f64,
    /// 95th percentile in milliseconds.
    pub p95: f64,
    /// 99th percentile in milliseconds.
    pub p99: f64,
    /// Maximum observed timing.
    pub max: f64,
    /// Share of operations over budget (0.0–1.0).
    pub over_budget_ratio: f64,
}

impl LatencyPercentiles {
    /// Format as a human-readable summary.
    #[must_use]
    pub fn summary(&self, budget_ms: f64) -> String {
        format!(
            "P50={:.2}ms  P95={:.2}ms  P99={:.2}ms  Max={:.2}ms  Budget={budget_ms:.1}ms  \
             Over-budget={:.1}%",
            self.p50,
            self.p95,
            self.p99,
            self.max,
            self.over_budget_ratio * 100.0,
        )
    }
}

// ---------------------------------------------------------------------------
// Tracing Span Names
// ---------------------------------------------------------------------------

/// Span names used with `tracing::info_span!`.
pub mod spans {
    /// Store call.
    pub const MEMORY_STORE: &str = "ctxmem::memory::store";
    /// Retrieve call.
    pub const MEMORY_RETRIEVE: &str = "ctxmem::memory::retrieve";
    /// Update call.
    pub const MEMORY_UPDATE: &str = "ctxmem::memory::update";
    /// Delete call.
    pub const MEMORY_DELETE: &str = "ctxmem::memory::delete";
    /// Consolidation pass.
    pub const CONSOLIDATION: &str = "ctxmem::consolidation";
    /// Shutdown.
    pub const SHUTDOWN: &str = "ctxmem::shutdown";
}
