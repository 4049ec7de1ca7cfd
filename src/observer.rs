//! Progress callbacks.
//!
//! The library never prints. Runs report through a [`ProgressObserver`]; the
//! CLI renders these as a spinner, library users can log or ignore them.

use std::time::Duration;

use tracing::{debug, info};

use crate::batch::BatchResult;
use crate::pool::{PoolMetrics, StrategyDecision};

/// Receives progress notifications from a run.
///
/// All methods default to no-ops. Callbacks are synchronous and run on the
/// coordinating task, so they must return quickly.
pub trait ProgressObserver: Send + Sync {
    /// The pool strategy for this run was chosen.
    fn on_strategy_selected(&self, _decision: &StrategyDecision) {}

    /// One wave finished.
    fn on_batch_complete(&self, _wave_index: usize, _result: &BatchResult) {}

    /// Retry round `round` (2 or later) is about to start with `remaining` URLs.
    fn on_retry_round(&self, _round: u32, _remaining: usize) {}

    /// Seconds left before retry round `round` starts.
    fn on_retry_countdown(&self, _round: u32, _seconds_left: u64) {}

    /// Pool metrics at the end of the run.
    fn on_pool_metrics(&self, _metrics: &PoolMetrics) {}
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Logs notifications at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_strategy_selected(&self, decision: &StrategyDecision) {
        info!(strategy = %decision.strategy, reason = %decision.reason, "strategy selected");
    }

    fn on_batch_complete(&self, wave_index: usize, result: &BatchResult) {
        info!(
            wave = wave_index + 1,
            succeeded = result.success_count,
            failed = result.fail_count,
            elapsed_ms = duration_ms(result.wave_time),
            "wave complete"
        );
    }

    fn on_retry_round(&self, round: u32, remaining: usize) {
        info!(round, remaining, "starting retry round");
    }

    fn on_retry_countdown(&self, round: u32, seconds_left: u64) {
        debug!(round, seconds_left, "waiting for retry round");
    }

    fn on_pool_metrics(&self, metrics: &PoolMetrics) {
        info!(
            strategy = %metrics.strategy_used,
            handles = metrics.total_handles,
            avg_batch_ms = metrics.avg_batch_time_ms,
            peak_memory_mb = metrics.peak_memory_mb,
            throughput = metrics.throughput_per_sec,
            "page pool metrics"
        );
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
