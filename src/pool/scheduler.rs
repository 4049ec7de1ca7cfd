//! Pool strategy selection.
//!
//! Precedence: manual override, then memory pressure, then the load scorer
//! (`pws` by default, the legacy `size` heuristic on request).

use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument};

use super::PoolStrategy;
use super::memory::MemoryProbe;
use super::score::{LoadEstimate, pws_score};
use crate::config::{PagePoolConfig, RunConfig, ScoringMode, StrategySetting};
use crate::download::{Transport, TransportSelector};

/// What decided the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyReason {
    /// `pagePoolStrategy` was set explicitly.
    Manual,
    /// Free memory was below `memoryThreshold`.
    MemoryPressure,
    /// PWS score compared with `autoThreshold`.
    LoadScore,
    /// Rendered count compared with `sizeThreshold`.
    SizeHeuristic,
}

impl fmt::Display for StrategyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual override",
            Self::MemoryPressure => "memory pressure",
            Self::LoadScore => "load score",
            Self::SizeHeuristic => "size heuristic",
        })
    }
}

/// Outcome of [`PagePoolScheduler::choose_strategy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyDecision {
    /// Chosen strategy.
    pub strategy: PoolStrategy,
    /// What decided it.
    pub reason: StrategyReason,
    /// PWS score, when computed.
    pub score: Option<f64>,
    /// Free-memory ratio, when read.
    pub free_ratio: Option<f64>,
    /// Rendered downloads expected in the first wave.
    pub rendered_in_first_wave: usize,
}

/// Chooses between `reuse` and `progressive`.
pub struct PagePoolScheduler {
    setting: StrategySetting,
    pool: PagePoolConfig,
    wave_size: usize,
    selector: TransportSelector,
    probe: Arc<dyn MemoryProbe>,
}

impl fmt::Debug for PagePoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePoolScheduler")
            .field("setting", &self.setting)
            .field("wave_size", &self.wave_size)
            .finish_non_exhaustive()
    }
}

impl PagePoolScheduler {
    /// Creates a scheduler reading memory through `probe`.
    #[must_use]
    pub fn new(config: &RunConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            setting: config.page_pool_strategy,
            pool: config.page_pool.clone(),
            wave_size: config.max_concurrent_requests.max(1),
            selector: TransportSelector::new(config),
            probe,
        }
    }

    /// Number of rendered downloads in the first wave of `urls`.
    #[must_use]
    pub fn first_wave_rendered(&self, urls: &[String], site_url: &str) -> usize {
        rendered_count(&self.selector, first_wave(urls, self.wave_size), site_url)
    }

    /// Picks the pool strategy for a run over `urls` found on `site_url`.
    #[instrument(skip(self, urls), fields(urls = urls.len()))]
    pub async fn choose_strategy(&self, urls: &[String], site_url: &str) -> StrategyDecision {
        let wave = first_wave(urls, self.wave_size);
        let rendered_in_first_wave = rendered_count(&self.selector, wave, site_url);

        let decision = match self.setting {
            StrategySetting::Reuse => manual(PoolStrategy::Reuse, rendered_in_first_wave),
            StrategySetting::Progressive => {
                manual(PoolStrategy::Progressive, rendered_in_first_wave)
            }
            StrategySetting::Auto => {
                let free_ratio = self.probe.snapshot().await.and_then(|s| s.free_ratio());
                self.auto(wave, site_url, free_ratio, rendered_in_first_wave)
            }
        };

        info!(
            strategy = %decision.strategy,
            reason = %decision.reason,
            score = ?decision.score,
            free_ratio = ?decision.free_ratio,
            rendered = decision.rendered_in_first_wave,
            "page pool strategy chosen"
        );
        decision
    }

    fn auto(
        &self,
        wave: &[String],
        site_url: &str,
        free_ratio: Option<f64>,
        rendered_in_first_wave: usize,
    ) -> StrategyDecision {
        if free_ratio.is_some_and(|ratio| ratio < self.pool.memory_threshold) {
            return StrategyDecision {
                strategy: PoolStrategy::Progressive,
                reason: StrategyReason::MemoryPressure,
                score: None,
                free_ratio,
                rendered_in_first_wave,
            };
        }

        match self.pool.scoring {
            ScoringMode::Size => StrategyDecision {
                strategy: if rendered_in_first_wave <= self.pool.size_threshold {
                    PoolStrategy::Reuse
                } else {
                    PoolStrategy::Progressive
                },
                reason: StrategyReason::SizeHeuristic,
                score: None,
                free_ratio,
                rendered_in_first_wave,
            },
            ScoringMode::Pws => {
                let estimate = LoadEstimate::from_wave(
                    wave.iter()
                        .map(|url| (url.as_str(), self.selector.select(url, site_url))),
                );
                let score = pws_score(&estimate, &self.pool.pws.weights);
                StrategyDecision {
                    strategy: strategy_for_score(score, self.pool.auto_threshold),
                    reason: StrategyReason::LoadScore,
                    score: Some(score),
                    free_ratio,
                    rendered_in_first_wave,
                }
            }
        }
    }
}

/// `reuse` below the threshold, `progressive` at or above it.
#[must_use]
pub fn strategy_for_score(score: f64, threshold: f64) -> PoolStrategy {
    if score < threshold {
        PoolStrategy::Reuse
    } else {
        PoolStrategy::Progressive
    }
}

fn manual(strategy: PoolStrategy, rendered_in_first_wave: usize) -> StrategyDecision {
    StrategyDecision {
        strategy,
        reason: StrategyReason::Manual,
        score: None,
        free_ratio: None,
        rendered_in_first_wave,
    }
}

fn first_wave(urls: &[String], wave_size: usize) -> &[String] {
    &urls[..urls.len().min(wave_size)]
}

pub(crate) fn rendered_count(selector: &TransportSelector, urls: &[String], site_url: &str) -> usize {
    urls.iter()
        .filter(|url| selector.select(url, site_url) == Transport::Rendered)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{DownloadMethod, PwsWeights};
    use crate::pool::memory::StaticMemoryProbe;

    const SITE: &str = "https://gallery.example.com/";

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://img.example.com/{i}.jpg")).collect()
    }

    fn scheduler(config: &RunConfig, free_ratio: f64) -> PagePoolScheduler {
        PagePoolScheduler::new(config, Arc::new(StaticMemoryProbe::with_free_ratio(free_ratio)))
    }

    #[tokio::test]
    async fn test_manual_override_wins() {
        let config = RunConfig {
            page_pool_strategy: StrategySetting::Reuse,
            ..RunConfig::default()
        };
        // even under memory pressure
        let decision = scheduler(&config, 0.01).choose_strategy(&urls(5), SITE).await;
        assert_eq!(decision.strategy, PoolStrategy::Reuse);
        assert_eq!(decision.reason, StrategyReason::Manual);
    }

    #[tokio::test]
    async fn test_low_memory_forces_progressive() {
        // weights that would push any score to zero
        let mut config = RunConfig::default();
        config.page_pool.pws.weights = PwsWeights {
            images: 0.0,
            dom: 0.0,
            payload: 0.0,
            heap: 0.0,
        };
        let decision = scheduler(&config, 0.10).choose_strategy(&urls(3), SITE).await;
        assert_eq!(decision.strategy, PoolStrategy::Progressive);
        assert_eq!(decision.reason, StrategyReason::MemoryPressure);
    }

    #[tokio::test]
    async fn test_light_wave_chooses_reuse() {
        let config = RunConfig::default();
        let decision = scheduler(&config, 0.80).choose_strategy(&urls(12), SITE).await;
        assert_eq!(decision.strategy, PoolStrategy::Reuse);
        assert_eq!(decision.reason, StrategyReason::LoadScore);
        assert!(decision.score.is_some_and(|s| s < 50.0));
        assert_eq!(decision.rendered_in_first_wave, 5);
    }

    #[tokio::test]
    async fn test_heavy_wave_chooses_progressive() {
        let config = RunConfig {
            max_concurrent_requests: 60,
            ..RunConfig::default()
        };
        let decision = scheduler(&config, 0.80).choose_strategy(&urls(60), SITE).await;
        assert_eq!(decision.strategy, PoolStrategy::Progressive);
        assert!(decision.score.is_some_and(|s| s >= 50.0));
    }

    #[tokio::test]
    async fn test_unknown_memory_falls_through_to_score() {
        let config = RunConfig::default();
        let scheduler =
            PagePoolScheduler::new(&config, Arc::new(StaticMemoryProbe::unknown()));
        let decision = scheduler.choose_strategy(&urls(3), SITE).await;
        assert_eq!(decision.reason, StrategyReason::LoadScore);
        assert_eq!(decision.free_ratio, None);
    }

    #[tokio::test]
    async fn test_size_heuristic() {
        let mut config = RunConfig {
            max_concurrent_requests: 20,
            ..RunConfig::default()
        };
        config.page_pool.scoring = ScoringMode::Size;
        config.page_pool.size_threshold = 10;

        let small = scheduler(&config, 0.9).choose_strategy(&urls(10), SITE).await;
        assert_eq!(small.strategy, PoolStrategy::Reuse);
        assert_eq!(small.reason, StrategyReason::SizeHeuristic);

        let large = scheduler(&config, 0.9).choose_strategy(&urls(11), SITE).await;
        assert_eq!(large.strategy, PoolStrategy::Progressive);
    }

    #[test]
    fn test_first_wave_rendered_skips_lightweight() {
        let config = RunConfig {
            download_method: DownloadMethod::Lightweight,
            ..RunConfig::default()
        };
        let scheduler = scheduler(&config, 0.5);
        assert_eq!(scheduler.first_wave_rendered(&urls(8), SITE), 0);
    }

    #[test]
    fn test_strategy_for_score_threshold_boundary() {
        assert_eq!(strategy_for_score(49.9, 50.0), PoolStrategy::Reuse);
        assert_eq!(strategy_for_score(50.0, 50.0), PoolStrategy::Progressive);
    }
}
