//! One download run over the image URLs of a site.
//!
//! [`Harvester::run`] wires the components together:
//!
//! 1. the URL list is deduplicated and a [`TaskLedger`] entry created per URL
//! 2. [`PagePoolScheduler`] picks the pool strategy once for the run
//! 3. [`RetryController`] drives [`BatchCoordinator`] rounds whose waves
//!    download through [`DownloadExecutor`]
//! 4. every open handle is closed, whether the run finished or aborted
//!
//! ```no_run
//! use harvest_core::config::RunConfig;
//! use harvest_core::download::FileSink;
//! use harvest_core::run::Harvester;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let harvester = Harvester::builder(RunConfig::default())
//!     .sink(Arc::new(FileSink::create("./images").await?))
//!     .build()?;
//! let urls = vec!["https://cdn.example.com/a.jpg".to_string()];
//! let report = harvester.run("https://example.com/gallery", &urls).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchCoordinator, RetryController, WaveHandler};
use crate::config::{ConfigError, RunConfig};
use crate::download::{
    BandwidthThrottle, BestImageLocator, ContentPolicy, CriticalError, DownloadError,
    DownloadExecutor, HttpClient, ImageLocator, ImageSink, LightweightTransport, MemorySink,
    RunContext, TransportSelector,
};
use crate::observer::{NoopObserver, ProgressObserver};
use crate::pool::{
    DisabledProvider, HandleProvider, MemoryProbe, PagePool, PagePoolScheduler,
    PageHealthMonitor, PoolMetrics, PoolStats, PoolStrategy, ProgressivePreloader,
    ResourceHandle, StrategyDecision, SystemMemoryProbe, rendered_count,
};
use crate::task::{DownloadTask, TaskLedger};

/// Errors that end a run without a report.
#[derive(Debug, Error)]
pub enum RunError {
    /// A critical persistence failure aborted the run.
    #[error("run aborted: {0}")]
    Aborted(#[from] CriticalError),

    /// The configuration failed validation.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Final report of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Page the URLs were found on.
    pub site: String,
    /// Strategy the run used.
    pub strategy: PoolStrategy,
    /// Distinct URLs downloaded.
    pub succeeded_count: usize,
    /// URLs still failing after the last round.
    pub permanently_failed_urls: Vec<String>,
    /// Rounds executed.
    pub rounds: u32,
    /// Pool metrics.
    pub metrics: PoolMetrics,
    /// Per-URL outcome.
    pub tasks: Vec<DownloadTask>,
}

impl RunReport {
    /// Returns true if no URL failed permanently.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.permanently_failed_urls.is_empty()
    }

    /// One-paragraph human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} of {} images downloaded from {} in {} round(s) using the {} strategy \
             ({} page handle(s), {:.1} images/s)",
            self.succeeded_count,
            self.tasks.len(),
            self.site,
            self.rounds,
            self.strategy,
            self.metrics.total_handles,
            self.metrics.throughput_per_sec,
        );
        if !self.permanently_failed_urls.is_empty() {
            out.push_str(&format!(
                "\n{} URL(s) failed permanently:",
                self.permanently_failed_urls.len()
            ));
            for url in &self.permanently_failed_urls {
                let reason = self
                    .tasks
                    .iter()
                    .find(|t| &t.url == url)
                    .and_then(|t| t.last_error.as_deref())
                    .unwrap_or("unknown error");
                out.push_str(&format!("\n  {url}: {reason}"));
            }
        }
        out
    }
}

/// Builder for [`Harvester`].
pub struct HarvesterBuilder {
    config: RunConfig,
    provider: Arc<dyn HandleProvider>,
    http: Option<Arc<dyn LightweightTransport>>,
    sink: Arc<dyn ImageSink>,
    probe: Arc<dyn MemoryProbe>,
    locator: Arc<dyn ImageLocator>,
    policy: ContentPolicy,
    observer: Arc<dyn ProgressObserver>,
}

impl HarvesterBuilder {
    /// Rendered-transport provider; without one every rendered download
    /// falls back to the lightweight transport.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn HandleProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Lightweight transport; defaults to a reqwest [`HttpClient`].
    #[must_use]
    pub fn http(mut self, http: Arc<dyn LightweightTransport>) -> Self {
        self.http = Some(http);
        self
    }

    /// Destination of downloaded images; defaults to a [`MemorySink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ImageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Memory probe for strategy selection and metrics.
    #[must_use]
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Embedded-image locator for HTML wrapper pages.
    #[must_use]
    pub fn locator(mut self, locator: Arc<dyn ImageLocator>) -> Self {
        self.locator = locator;
        self
    }

    /// Binary content policy.
    #[must_use]
    pub fn content_policy(mut self, policy: ContentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Progress observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validates the config and builds the harvester.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::InvalidConfig`] or [`RunError::HttpClient`].
    pub fn build(self) -> Result<Harvester, RunError> {
        self.config.validate()?;
        let http = match self.http {
            Some(http) => http,
            None => Arc::new(HttpClient::new().map_err(RunError::HttpClient)?),
        };
        let throttle = Arc::new(BandwidthThrottle::new(self.config.network.bandwidth_limit_kbps));
        Ok(Harvester {
            config: self.config,
            provider: self.provider,
            http,
            sink: self.sink,
            probe: self.probe,
            locator: self.locator,
            policy: self.policy,
            observer: self.observer,
            throttle,
        })
    }
}

/// Runs downloads for one site at a time.
///
/// The bandwidth throttle lives as long as the harvester, so consecutive
/// runs share one budget.
pub struct Harvester {
    config: RunConfig,
    provider: Arc<dyn HandleProvider>,
    http: Arc<dyn LightweightTransport>,
    sink: Arc<dyn ImageSink>,
    probe: Arc<dyn MemoryProbe>,
    locator: Arc<dyn ImageLocator>,
    policy: ContentPolicy,
    observer: Arc<dyn ProgressObserver>,
    throttle: Arc<BandwidthThrottle>,
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("config", &self.config)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Starts a builder with defaults for every collaborator.
    #[must_use]
    pub fn builder(config: RunConfig) -> HarvesterBuilder {
        HarvesterBuilder {
            config,
            provider: Arc::new(DisabledProvider),
            http: None,
            sink: Arc::new(MemorySink::new()),
            probe: Arc::new(SystemMemoryProbe),
            locator: Arc::new(BestImageLocator),
            policy: ContentPolicy::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Downloads `urls` found on `site_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Aborted`] when a download raised a critical error.
    /// All handles are closed before it is returned.
    #[instrument(skip(self, urls), fields(site = %site_url, urls = urls.len()))]
    pub async fn run(&self, site_url: &str, urls: &[String]) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let urls = dedupe(urls);
        let ledger = TaskLedger::new(&urls);

        let scheduler = PagePoolScheduler::new(&self.config, Arc::clone(&self.probe));
        let decision = scheduler.choose_strategy(&urls, site_url).await;
        self.observer.on_strategy_selected(&decision);

        let executor = DownloadExecutor::new(
            Arc::clone(&self.http),
            Arc::clone(&self.throttle),
            Arc::clone(&self.sink),
            self.config.request_timeout(),
        )
        .with_locator(Arc::clone(&self.locator))
        .with_policy(self.policy.clone());

        let stats = Arc::new(PoolStats::new());
        let runtime = StrategyRuntime::start(self, site_url, &decision, &executor, &ledger, &stats).await;

        let coordinator = BatchCoordinator::new(&self.config, Arc::clone(&self.observer));
        let retry = RetryController::new(&self.config, Arc::clone(&self.observer));
        let outcome = {
            let coordinator = &coordinator;
            let handler = &runtime;
            retry
                .run_with_retries(urls, move |round_urls| async move {
                    coordinator.run(&round_urls, handler).await
                })
                .await
        };

        runtime.shutdown().await;
        let report = outcome?;

        let metrics = PoolMetrics::summarize(
            decision.strategy,
            &stats,
            report.batches.wave_count,
            report.batches.wave_time,
            report.succeeded_count,
            started.elapsed(),
        );
        self.observer.on_pool_metrics(&metrics);
        info!(
            succeeded = report.succeeded_count,
            failed = report.permanently_failed_urls.len(),
            rounds = report.rounds,
            "run complete"
        );

        Ok(RunReport {
            site: site_url.to_string(),
            strategy: decision.strategy,
            succeeded_count: report.succeeded_count,
            permanently_failed_urls: report.permanently_failed_urls,
            rounds: report.rounds,
            metrics,
            tasks: ledger.snapshot(),
        })
    }
}

fn dedupe(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let unique: Vec<String> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty() && seen.insert(*u))
        .map(str::to_string)
        .collect();
    if unique.len() < urls.len() {
        debug!(dropped = urls.len() - unique.len(), "dropped duplicate or blank URLs");
    }
    unique
}

/// Pool lifecycle of the chosen strategy, driven by the coordinator's wave hooks.
struct StrategyRuntime<'a> {
    site_url: &'a str,
    strategy: PoolStrategy,
    selector: TransportSelector,
    executor: &'a DownloadExecutor,
    ledger: &'a TaskLedger,
    provider: Arc<dyn HandleProvider>,
    health: PageHealthMonitor,
    stats: Arc<PoolStats>,
    probe: Arc<dyn MemoryProbe>,
    preloader: Option<ProgressivePreloader>,
    active: Mutex<Arc<PagePool>>,
    preloaded: Mutex<Option<Vec<ResourceHandle>>>,
}

impl<'a> StrategyRuntime<'a> {
    async fn start(
        harvester: &Harvester,
        site_url: &'a str,
        decision: &StrategyDecision,
        executor: &'a DownloadExecutor,
        ledger: &'a TaskLedger,
        stats: &Arc<PoolStats>,
    ) -> Self {
        let config = &harvester.config;
        let provider = Arc::clone(&harvester.provider);
        let health = PageHealthMonitor::new(config.page_pool.reuse);
        let selector = TransportSelector::new(config);

        let pool = match decision.strategy {
            PoolStrategy::Reuse => {
                PagePool::fill(
                    Arc::clone(&provider),
                    health,
                    Arc::clone(stats),
                    decision.rendered_in_first_wave,
                )
                .await
            }
            PoolStrategy::Progressive => {
                PagePool::empty(Arc::clone(&provider), health, Arc::clone(stats))
            }
        };
        let preloader = (decision.strategy == PoolStrategy::Progressive
            && config.page_pool.progressive.preload)
            .then(|| {
                ProgressivePreloader::new(Arc::clone(&provider), selector.clone(), Arc::clone(stats))
            });

        Self {
            site_url,
            strategy: decision.strategy,
            selector,
            executor,
            ledger,
            provider,
            health,
            stats: Arc::clone(stats),
            probe: Arc::clone(&harvester.probe),
            preloader,
            active: Mutex::new(Arc::new(pool)),
            preloaded: Mutex::new(None),
        }
    }

    fn active_pool(&self) -> Arc<PagePool> {
        Arc::clone(&self.active.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace_pool(&self, pool: PagePool) -> Arc<PagePool> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, Arc::new(pool))
    }

    fn take_preloaded(&self) -> Option<Vec<ResourceHandle>> {
        self.preloaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn sample_memory(&self) {
        if let Some(snapshot) = self.probe.snapshot().await {
            self.stats.record_memory_mb(snapshot.used_mb());
        }
    }

    async fn close_pool(&self, pool: &PagePool) {
        let closed = pool.close_all().await;
        debug!(closed, "page pool closed");
    }

    /// Closes every handle the runtime still owns.
    async fn shutdown(&self) {
        let pool = self.replace_pool(PagePool::empty(
            Arc::clone(&self.provider),
            self.health,
            Arc::clone(&self.stats),
        ));
        self.close_pool(&pool).await;
        if let Some(handles) = self.take_preloaded() {
            if let Some(preloader) = &self.preloader {
                preloader.discard(handles).await;
            }
        }
        debug!(
            created = self.stats.handles_created(),
            closed = self.stats.handles_closed(),
            "page pool shut down"
        );
    }
}

#[async_trait]
impl WaveHandler for StrategyRuntime<'_> {
    async fn prepare_wave(&self, wave_index: usize, urls: &[String]) {
        if self.strategy != PoolStrategy::Progressive {
            return;
        }
        let pool = match self.take_preloaded() {
            Some(handles) => {
                debug!(wave = wave_index + 1, handles = handles.len(), "using preloaded handles");
                PagePool::from_handles(
                    Arc::clone(&self.provider),
                    self.health,
                    Arc::clone(&self.stats),
                    handles,
                )
            }
            None => {
                let size = rendered_count(&self.selector, urls, self.site_url);
                PagePool::fill(
                    Arc::clone(&self.provider),
                    self.health,
                    Arc::clone(&self.stats),
                    size,
                )
                .await
            }
        };
        let previous = self.replace_pool(pool);
        self.close_pool(&previous).await;
    }

    async fn download(&self, url: &str) -> Result<(), DownloadError> {
        let transport = self.selector.select(url, self.site_url);
        let pool = self.active_pool();
        let ctx = RunContext {
            site_url: self.site_url,
            pool: &pool,
        };
        match self.executor.execute(url, transport, &ctx).await {
            Ok(result) => {
                self.ledger
                    .record_success(url, result.attempts, result.transport);
                Ok(())
            }
            Err(failure) => {
                self.ledger
                    .record_failure(url, failure.attempts, &failure.error);
                Err(failure.error)
            }
        }
    }

    async fn overlap(&self, wave_index: usize, next_wave: Option<&[String]>) {
        let (Some(preloader), Some(next)) = (&self.preloader, next_wave) else {
            return;
        };
        let handles = preloader.preload(next, self.site_url).await;
        debug!(wave = wave_index + 2, handles = handles.len(), "next wave preloaded");
        let stale = self
            .preloaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handles);
        if let Some(stale) = stale {
            warn!(count = stale.len(), "discarding unused preloaded handles");
            preloader.discard(stale).await;
        }
    }

    async fn finish_wave(&self, _wave_index: usize) {
        if self.strategy == PoolStrategy::Progressive {
            let pool = self.replace_pool(PagePool::empty(
                Arc::clone(&self.provider),
                self.health,
                Arc::clone(&self.stats),
            ));
            self.close_pool(&pool).await;
        }
        self.sample_memory().await;
    }
}
