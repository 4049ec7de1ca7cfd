//! Wave execution and retry rounds.
//!
//! [`BatchCoordinator`] splits a URL list into waves of `maxConcurrentRequests`
//! downloads. All downloads of a wave run concurrently and the wave settles
//! before the next starts. Between waves the coordinator waits a random
//! interval from the configured window, minus the time the previous wave
//! already took.
//!
//! A critical error from any download stops the run after the current wave
//! settles; it is returned instead of being folded into the failed URLs.
//!
//! [`RetryController`] drives repeated coordinator passes over the failed URLs.

mod retry;

pub use retry::{RetryController, RetryReport, RoundTransition, next_transition};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RunConfig;
use crate::download::{CriticalError, DownloadError};
use crate::observer::{NoopObserver, ProgressObserver};

/// Outcome of one or more waves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// URLs attempted.
    pub total: usize,
    /// Successful downloads.
    pub success_count: usize,
    /// Failed downloads.
    pub fail_count: usize,
    /// URLs that failed, in wave order.
    pub failed_urls: Vec<String>,
    /// Waves executed.
    pub wave_count: usize,
    /// Wall time spent inside waves, delays excluded.
    pub wave_time: Duration,
}

impl BatchResult {
    /// Adds `other` into this result.
    pub fn merge(&mut self, other: BatchResult) {
        self.total += other.total;
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.failed_urls.extend(other.failed_urls);
        self.wave_count += other.wave_count;
        self.wave_time += other.wave_time;
    }

    /// Returns true if every URL succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_urls.is_empty()
    }
}

/// Work performed for each wave.
///
/// Only [`download`](WaveHandler::download) is required. The hooks let a
/// pool strategy open handles before a wave, prepare the next wave while the
/// current one downloads, and release handles afterwards.
#[async_trait]
pub trait WaveHandler: Send + Sync {
    /// Called before the downloads of wave `wave_index` start.
    async fn prepare_wave(&self, _wave_index: usize, _urls: &[String]) {}

    /// Downloads one URL.
    ///
    /// # Errors
    ///
    /// Any [`DownloadError`]; [`DownloadError::Critical`] stops the run.
    async fn download(&self, url: &str) -> Result<(), DownloadError>;

    /// Runs concurrently with the downloads of wave `wave_index`.
    ///
    /// `next_wave` is `None` for the last wave.
    async fn overlap(&self, _wave_index: usize, _next_wave: Option<&[String]>) {}

    /// Called after wave `wave_index` settled, also when it raised a critical
    /// error.
    async fn finish_wave(&self, _wave_index: usize) {}
}

/// Splits URL lists into waves and runs them.
pub struct BatchCoordinator {
    wave_size: usize,
    min_interval_ms: u64,
    max_interval_ms: u64,
    observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("wave_size", &self.wave_size)
            .field("min_interval_ms", &self.min_interval_ms)
            .field("max_interval_ms", &self.max_interval_ms)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Creates a coordinator from the run config.
    #[must_use]
    pub fn new(config: &RunConfig, observer: Arc<dyn ProgressObserver>) -> Self {
        Self::with_limits(
            config.max_concurrent_requests,
            config.min_interval_ms,
            config.max_interval_ms,
            observer,
        )
    }

    /// Creates a coordinator with explicit limits.
    ///
    /// A zero wave size is treated as one; an inverted interval window is
    /// collapsed to its lower bound.
    #[must_use]
    pub fn with_limits(
        wave_size: usize,
        min_interval_ms: u64,
        max_interval_ms: u64,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            wave_size: wave_size.max(1),
            min_interval_ms,
            max_interval_ms: max_interval_ms.max(min_interval_ms),
            observer,
        }
    }

    /// Number of URLs per wave.
    #[must_use]
    pub fn wave_size(&self) -> usize {
        self.wave_size
    }

    /// Runs `urls` wave by wave through `handler`.
    ///
    /// # Errors
    ///
    /// Returns the first [`CriticalError`] raised by a download. No further
    /// wave is started once one is seen.
    #[instrument(skip(self, urls, handler), fields(urls = urls.len(), wave_size = self.wave_size))]
    pub async fn run(
        &self,
        urls: &[String],
        handler: &dyn WaveHandler,
    ) -> Result<BatchResult, CriticalError> {
        let waves: Vec<&[String]> = urls.chunks(self.wave_size).collect();
        let mut result = BatchResult::default();
        let mut previous_start: Option<Instant> = None;

        for (index, wave) in waves.iter().enumerate() {
            if let Some(started) = previous_start {
                let delay = inter_wave_delay(self.scheduled_interval(), started.elapsed());
                if !delay.is_zero() {
                    debug!(wave = index + 1, delay_ms = delay.as_millis(), "waiting before next wave");
                    tokio::time::sleep(delay).await;
                }
            }

            let started = Instant::now();
            previous_start = Some(started);
            info!(wave = index + 1, of = waves.len(), size = wave.len(), "starting wave");

            handler.prepare_wave(index, wave).await;
            let downloads = join_all(wave.iter().map(|url| async move {
                let outcome = handler.download(url).await;
                (url, outcome)
            }));
            let next_wave = waves.get(index + 1).copied();
            let (outcomes, ()) = tokio::join!(downloads, handler.overlap(index, next_wave));
            handler.finish_wave(index).await;

            let mut wave_result = BatchResult {
                total: wave.len(),
                wave_count: 1,
                ..BatchResult::default()
            };
            let mut critical = None;
            for (url, outcome) in outcomes {
                match outcome {
                    Ok(()) => wave_result.success_count += 1,
                    Err(DownloadError::Critical(e)) => {
                        wave_result.fail_count += 1;
                        critical.get_or_insert(e);
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "download failed");
                        wave_result.fail_count += 1;
                        wave_result.failed_urls.push(url.clone());
                    }
                }
            }
            wave_result.wave_time = started.elapsed();
            self.observer.on_batch_complete(index, &wave_result);

            if let Some(e) = critical {
                error!(wave = index + 1, url = %e.url, reason = %e.reason, "critical error, stopping run");
                return Err(e);
            }
            if !wave_result.is_clean() {
                warn!(wave = index + 1, failed = wave_result.fail_count, "wave finished with failures");
            }
            result.merge(wave_result);
        }

        Ok(result)
    }

    fn scheduled_interval(&self) -> Duration {
        let ms = if self.max_interval_ms > self.min_interval_ms {
            rand::thread_rng().gen_range(self.min_interval_ms..=self.max_interval_ms)
        } else {
            self.min_interval_ms
        };
        Duration::from_millis(ms)
    }
}

/// Time left to wait before the next wave.
///
/// `scheduled` is measured from the start of the previous wave; when that
/// wave took longer, the result is zero.
#[must_use]
pub fn inter_wave_delay(scheduled: Duration, elapsed: Duration) -> Duration {
    scheduled.saturating_sub(elapsed)
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WaveHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DownloadError>> + Send,
{
    async fn download(&self, url: &str) -> Result<(), DownloadError> {
        (self.0)(url.to_string()).await
    }
}

/// Runs `urls` in waves through a plain download function.
///
/// # Errors
///
/// Returns the first [`CriticalError`] raised by `download_fn`.
pub async fn run_batches<F, Fut>(
    urls: &[String],
    max_concurrency: usize,
    min_delay_ms: u64,
    max_delay_ms: u64,
    download_fn: F,
) -> Result<BatchResult, CriticalError>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DownloadError>> + Send,
{
    let coordinator =
        BatchCoordinator::with_limits(max_concurrency, min_delay_ms, max_delay_ms, Arc::new(NoopObserver));
    coordinator.run(urls, &FnHandler(download_fn)).await
}
