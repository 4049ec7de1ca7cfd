//! Progress UI (spinner) for download runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harvest_core::{BatchResult, PoolMetrics, ProgressObserver};
use harvest_core::pool::StrategyDecision;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Spinner driven by run callbacks.
///
/// Hidden when stderr is not a terminal or output is quiet.
pub(crate) struct SpinnerObserver {
    spinner: ProgressBar,
    total: usize,
    done: AtomicUsize,
}

impl SpinnerObserver {
    pub(crate) fn new(enabled: bool, total: usize) -> Self {
        let spinner = if enabled {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(format!("[0/{total}] Starting..."));
            spinner
        } else {
            ProgressBar::hidden()
        };
        Self {
            spinner,
            total,
            done: AtomicUsize::new(0),
        }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressObserver for SpinnerObserver {
    fn on_strategy_selected(&self, decision: &StrategyDecision) {
        self.spinner.set_message(format!(
            "[0/{}] Using {} page pool ({})",
            self.total, decision.strategy, decision.reason
        ));
    }

    fn on_batch_complete(&self, wave_index: usize, result: &BatchResult) {
        let done = self.done.fetch_add(result.success_count, Ordering::SeqCst) + result.success_count;
        self.spinner.set_message(format!(
            "[{}/{}] Wave {} done ({} failed)",
            done.min(self.total),
            self.total,
            wave_index + 1,
            result.fail_count
        ));
    }

    fn on_retry_round(&self, round: u32, remaining: usize) {
        self.spinner
            .set_message(format!("Retry round {round}: {remaining} URL(s) left"));
    }

    fn on_retry_countdown(&self, round: u32, seconds_left: u64) {
        self.spinner
            .set_message(format!("Retry round {round} in {seconds_left}s..."));
    }

    fn on_pool_metrics(&self, metrics: &PoolMetrics) {
        info!(
            strategy = %metrics.strategy_used,
            handles = metrics.total_handles,
            avg_batch_ms = metrics.avg_batch_time_ms,
            peak_memory_mb = metrics.peak_memory_mb,
            "page pool metrics"
        );
    }
}
