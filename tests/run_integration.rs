//! End-to-end runs of the harvester over an in-memory browser.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harvest_core::download::{ImageSink, MemorySink, SaveError};
use harvest_core::pool::{HandleProvider, StaticMemoryProbe, StrategyDecision};
use harvest_core::{
    BatchResult, DownloadMethod, Harvester, PoolStrategy, ProgressObserver, RunConfig, RunError,
    StrategySetting, TaskStatus, Transport,
};
use reqwest::header::HeaderMap;

mod support;
use support::fake_browser::{FakeBrowser, OfflineHttp};

const SITE: &str = "https://gallery.example.com/album";

fn image_urls(n: usize) -> Vec<String> {
    (1..=n)
        .map(|i| format!("https://img.example.com/{i}.jpg"))
        .collect()
}

fn quick_config() -> RunConfig {
    RunConfig {
        max_concurrent_requests: 5,
        min_interval_ms: 0,
        max_interval_ms: 0,
        retry_delay_seconds: 0,
        download_method: DownloadMethod::RenderedPriority,
        ..RunConfig::default()
    }
}

/// Records wave completions and the chosen strategy.
#[derive(Default)]
struct Recorder {
    waves: Mutex<Vec<(usize, usize, usize)>>,
    strategy: Mutex<Option<PoolStrategy>>,
}

impl ProgressObserver for Recorder {
    fn on_strategy_selected(&self, decision: &StrategyDecision) {
        *self.strategy.lock().unwrap() = Some(decision.strategy);
    }

    fn on_batch_complete(&self, wave_index: usize, result: &BatchResult) {
        self.waves
            .lock()
            .unwrap()
            .push((wave_index, result.success_count, result.fail_count));
    }
}

fn harvester(
    config: RunConfig,
    browser: &Arc<FakeBrowser>,
    free_ratio: f64,
    sink: Arc<dyn ImageSink>,
    observer: Arc<Recorder>,
) -> Harvester {
    let provider: Arc<dyn HandleProvider> = browser.clone();
    Harvester::builder(config)
        .provider(provider)
        .http(Arc::new(OfflineHttp::default()))
        .sink(sink)
        .memory_probe(Arc::new(StaticMemoryProbe::with_free_ratio(free_ratio)))
        .observer(observer)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_twelve_urls_run_in_three_waves() {
    let browser = Arc::new(FakeBrowser::new());
    let sink = Arc::new(MemorySink::new());
    let recorder = Arc::new(Recorder::default());
    let report = harvester(
        quick_config(),
        &browser,
        0.8,
        sink.clone(),
        recorder.clone(),
    )
    .run(SITE, &image_urls(12))
    .await
    .unwrap();

    assert_eq!(report.succeeded_count, 12);
    assert!(report.permanently_failed_urls.is_empty());
    assert_eq!(report.rounds, 1);
    assert_eq!(sink.len(), 12);

    let waves = recorder.waves.lock().unwrap().clone();
    assert_eq!(waves, vec![(0, 5, 0), (1, 5, 0), (2, 2, 0)]);

    assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Succeeded
        && t.attempt_count == 1
        && t.transport == Some(Transport::Rendered)));
    assert_eq!(browser.open(), 0, "every handle closed at the end of the run");
    assert_eq!(report.metrics.total_handles, browser.created());
    assert_eq!(report.metrics.handles_closed, browser.closed());
}

#[tokio::test]
async fn test_html_wrapper_resolved_to_embedded_image() {
    let wrapper = "https://img.example.com/view/3";
    let browser = Arc::new(
        FakeBrowser::new()
            .html(
                wrapper,
                r#"<html><head><meta property="og:image" content="https://cdn.example.com/full/3.jpg"></head>
                   <body><img src="https://cdn.example.com/full/3.jpg" width="1600" height="1200"></body></html>"#,
            )
            .image("https://cdn.example.com/full/3.jpg", b"full-size-jpeg"),
    );
    let sink = Arc::new(MemorySink::new());
    let mut urls = image_urls(4);
    urls[2] = wrapper.to_string();

    let report = harvester(
        quick_config(),
        &browser,
        0.8,
        sink.clone(),
        Arc::new(Recorder::default()),
    )
    .run(SITE, &urls)
    .await
    .unwrap();

    assert_eq!(report.succeeded_count, 4);
    let task = report.tasks.iter().find(|t| t.url == wrapper).unwrap();
    assert_eq!(task.attempt_count, 2, "wrapper page plus embedded image");
    assert_eq!(sink.get(wrapper).as_deref(), Some(&b"full-size-jpeg"[..]));
}

#[tokio::test]
async fn test_memory_pressure_forces_progressive() {
    let browser = Arc::new(FakeBrowser::new());
    let recorder = Arc::new(Recorder::default());
    let config = RunConfig {
        page_pool_strategy: StrategySetting::Auto,
        ..quick_config()
    };

    let report = harvester(
        config,
        &browser,
        0.10,
        Arc::new(MemorySink::new()),
        recorder.clone(),
    )
    .run(SITE, &image_urls(12))
    .await
    .unwrap();

    assert_eq!(report.strategy, PoolStrategy::Progressive);
    assert_eq!(
        *recorder.strategy.lock().unwrap(),
        Some(PoolStrategy::Progressive)
    );
    assert_eq!(report.succeeded_count, 12);
    assert_eq!(browser.open(), 0);
    assert_eq!(report.metrics.handles_closed, browser.closed());
}

#[tokio::test]
async fn test_failed_url_retried_then_reported() {
    let missing = "https://img.example.com/2.jpg";
    let browser = Arc::new(FakeBrowser::new().status(missing, 404));
    let config = RunConfig {
        max_retries: 2,
        ..quick_config()
    };

    let report = harvester(
        config,
        &browser,
        0.8,
        Arc::new(MemorySink::new()),
        Arc::new(Recorder::default()),
    )
    .run(SITE, &image_urls(6))
    .await
    .unwrap();

    assert_eq!(report.succeeded_count, 5);
    assert_eq!(report.rounds, 3);
    assert_eq!(report.permanently_failed_urls, vec![missing.to_string()]);
    let task = report.tasks.iter().find(|t| t.url == missing).unwrap();
    assert_eq!(task.attempt_count, 6, "rendered and fallback request in each round");
    assert!(!report.is_complete());
    assert!(report.summary().contains(missing));
}

/// Fails critically for one URL, stores everything else.
struct FullDisk {
    poisoned: String,
    inner: MemorySink,
}

#[async_trait]
impl ImageSink for FullDisk {
    async fn save(&self, buffer: &[u8], url: &str, headers: &HeaderMap) -> Result<(), SaveError> {
        if url == self.poisoned {
            return Err(SaveError::critical("No space left on device", None));
        }
        self.inner.save(buffer, url, headers).await
    }
}

#[tokio::test]
async fn test_critical_save_aborts_run_and_closes_handles() {
    let browser = Arc::new(FakeBrowser::new());
    let recorder = Arc::new(Recorder::default());
    let sink = Arc::new(FullDisk {
        poisoned: "https://img.example.com/3.jpg".to_string(),
        inner: MemorySink::new(),
    });

    let result = harvester(quick_config(), &browser, 0.8, sink, recorder.clone())
        .run(SITE, &image_urls(12))
        .await;

    let Err(RunError::Aborted(error)) = result else {
        panic!("expected an aborted run, got {result:?}");
    };
    assert_eq!(error.url, "https://img.example.com/3.jpg");
    assert!(error.reason.contains("No space left"));
    assert_eq!(
        recorder.waves.lock().unwrap().len(),
        1,
        "no wave starts after a critical failure"
    );
    assert!(browser.navigations() <= 5);
    assert_eq!(browser.open(), 0, "handles closed on abort");
}
