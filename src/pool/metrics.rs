//! Run-level pool accounting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::PoolStrategy;

/// Lock-free counters shared by every pool and the preloader of one run.
#[derive(Debug, Default)]
pub struct PoolStats {
    handles_created: AtomicUsize,
    handles_closed: AtomicUsize,
    handles_recycled: AtomicUsize,
    on_demand_created: AtomicUsize,
    /// Peak memory in KB.
    peak_memory_kb: AtomicU64,
}

impl PoolStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.handles_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recycled(&self) {
        self.handles_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_on_demand(&self) {
        self.on_demand_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a memory reading, keeping the maximum.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn record_memory_mb(&self, used_mb: f64) {
        if used_mb.is_finite() && used_mb > 0.0 {
            let kb = (used_mb * 1024.0).round() as u64;
            self.peak_memory_kb.fetch_max(kb, Ordering::Relaxed);
        }
    }

    /// Handles opened so far.
    #[must_use]
    pub fn handles_created(&self) -> usize {
        self.handles_created.load(Ordering::Relaxed)
    }

    /// Handles closed so far.
    #[must_use]
    pub fn handles_closed(&self) -> usize {
        self.handles_closed.load(Ordering::Relaxed)
    }

    /// Handles replaced after an unhealthy verdict.
    #[must_use]
    pub fn handles_recycled(&self) -> usize {
        self.handles_recycled.load(Ordering::Relaxed)
    }

    /// Handles created outside any slot because no slot was free.
    #[must_use]
    pub fn on_demand_created(&self) -> usize {
        self.on_demand_created.load(Ordering::Relaxed)
    }

    /// Handles created but not closed yet.
    #[must_use]
    pub fn handles_open(&self) -> usize {
        self.handles_created().saturating_sub(self.handles_closed())
    }

    /// Peak memory reading in MB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_kb.load(Ordering::Relaxed) as f64 / 1024.0
    }
}

/// Pool metrics of a finished run; for reporting only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    /// Strategy the run used.
    pub strategy_used: PoolStrategy,
    /// Handles opened during the run.
    pub total_handles: usize,
    /// Handles closed by the end of the run.
    pub handles_closed: usize,
    /// Mean wall time of one wave.
    pub avg_batch_time_ms: f64,
    /// Peak memory reading.
    pub peak_memory_mb: f64,
    /// Successful downloads per second of run time.
    pub throughput_per_sec: f64,
}

impl PoolMetrics {
    /// Builds the summary from run totals.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summarize(
        strategy_used: PoolStrategy,
        stats: &PoolStats,
        wave_count: usize,
        wave_time: Duration,
        succeeded: usize,
        run_time: Duration,
    ) -> Self {
        let avg_batch_time_ms = if wave_count == 0 {
            0.0
        } else {
            wave_time.as_secs_f64() * 1000.0 / wave_count as f64
        };
        let run_secs = run_time.as_secs_f64();
        let throughput_per_sec = if run_secs > 0.0 {
            succeeded as f64 / run_secs
        } else {
            0.0
        };
        Self {
            strategy_used,
            total_handles: stats.handles_created(),
            handles_closed: stats.handles_closed(),
            avg_batch_time_ms,
            peak_memory_mb: stats.peak_memory_mb(),
            throughput_per_sec,
        }
    }
}
