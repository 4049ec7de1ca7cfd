//! Retry rounds over failed URLs.
//!
//! Round `n` runs the current failed set. An empty result finishes the run;
//! reaching `maxRounds` reports the rest as permanently failed; otherwise the
//! controller counts down `retryDelaySeconds` and starts round `n + 1`.
//! A critical error in any round ends the run immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::BatchResult;
use crate::config::RunConfig;
use crate::download::CriticalError;
use crate::observer::ProgressObserver;

/// What follows a finished round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTransition {
    /// Nothing left to retry.
    Finished,
    /// Round budget spent with URLs still failing.
    Exhausted,
    /// Wait, then run `next_round` over the failed URLs.
    Continue {
        /// Number of the next round (1-based).
        next_round: u32,
    },
}

/// Decides what follows round `round` (1-based) that left `failed` URLs.
#[must_use]
pub fn next_transition(round: u32, max_rounds: u32, failed: usize) -> RoundTransition {
    if failed == 0 {
        RoundTransition::Finished
    } else if round >= max_rounds {
        RoundTransition::Exhausted
    } else {
        RoundTransition::Continue {
            next_round: round + 1,
        }
    }
}

/// Final outcome of all rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// URLs that succeeded in any round.
    pub succeeded_count: usize,
    /// URLs still failing after the last round.
    pub permanently_failed_urls: Vec<String>,
    /// Rounds executed.
    pub rounds: u32,
    /// Waves and wave time summed over all rounds.
    pub batches: BatchResult,
}

/// Re-runs failed URLs for a bounded number of rounds.
pub struct RetryController {
    max_rounds: u32,
    delay: Duration,
    observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("max_rounds", &self.max_rounds)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl RetryController {
    /// Creates a controller with `maxRetries + 1` rounds.
    #[must_use]
    pub fn new(config: &RunConfig, observer: Arc<dyn ProgressObserver>) -> Self {
        Self::with_limits(config.max_rounds(), config.retry_delay(), observer)
    }

    /// Creates a controller with explicit limits; at least one round runs.
    #[must_use]
    pub fn with_limits(max_rounds: u32, delay: Duration, observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            delay,
            observer,
        }
    }

    /// Runs `run_round` over `urls`, then over each round's failures.
    ///
    /// # Errors
    ///
    /// Returns the [`CriticalError`] of the round that raised it; no further
    /// round starts.
    #[instrument(skip(self, urls, run_round), fields(urls = urls.len(), max_rounds = self.max_rounds))]
    pub async fn run_with_retries<F, Fut>(
        &self,
        urls: Vec<String>,
        mut run_round: F,
    ) -> Result<RetryReport, CriticalError>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<BatchResult, CriticalError>>,
    {
        let mut report = RetryReport::default();
        let mut pending = urls;
        let mut round = 1;

        loop {
            if round > 1 {
                self.observer.on_retry_round(round, pending.len());
            }
            info!(round, urls = pending.len(), "starting round");

            let result = run_round(pending).await?;
            report.rounds = round;
            report.succeeded_count += result.success_count;
            pending = result.failed_urls.clone();
            report.batches.merge(result);

            match next_transition(round, self.max_rounds, pending.len()) {
                RoundTransition::Finished => {
                    info!(round, succeeded = report.succeeded_count, "all downloads succeeded");
                    break;
                }
                RoundTransition::Exhausted => {
                    warn!(round, failed = pending.len(), "retry rounds exhausted");
                    report.permanently_failed_urls = pending;
                    break;
                }
                RoundTransition::Continue { next_round } => {
                    self.countdown(next_round).await;
                    round = next_round;
                }
            }
        }

        Ok(report)
    }

    async fn countdown(&self, next_round: u32) {
        let tick = Duration::from_secs(1);
        let mut left = self.delay;
        while !left.is_zero() {
            let seconds_left = left.as_secs() + u64::from(left.subsec_nanos() > 0);
            self.observer.on_retry_countdown(next_round, seconds_left);
            let step = left.min(tick);
            tokio::time::sleep(step).await;
            left -= step;
        }
    }
}
