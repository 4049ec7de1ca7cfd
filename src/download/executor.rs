//! One download attempt for one URL.
//!
//! The rendered path navigates a leased page, follows HTML wrapper pages to
//! their embedded image (at most [`MAX_HTML_RECURSION`] levels) and checks the
//! binary content policy. Any rendered failure is retried once over the
//! lightweight transport before it reaches the caller. The lightweight path
//! streams the body through the shared [`BandwidthThrottle`] and rejects HTML.
//!
//! Successful buffers go to the [`ImageSink`]; a critical sink error is
//! returned as [`DownloadError::Critical`] untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::client::{HttpResponse, LightweightTransport, RequestHeaders};
use super::constants::MAX_HTML_RECURSION;
use super::content::{ContentPolicy, content_type, is_html};
use super::error::DownloadError;
use super::locate::{BestImageLocator, ImageLocator};
use super::sink::ImageSink;
use super::throttle::BandwidthThrottle;
use super::transport::Transport;
use crate::pool::{Lease, PagePool, ProviderError};

/// A downloaded and persisted image.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Image bytes.
    pub buffer: Bytes,
    /// URL the bytes came from after redirects and HTML resolution.
    pub final_url: String,
    /// Response headers of the image.
    pub headers: HeaderMap,
    /// Transport that produced the bytes.
    pub transport: Transport,
    /// Requests issued for this URL, navigations and fallback included.
    pub attempts: u32,
}

/// Per-run state the executor needs.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    /// Page the URLs were found on; sent as Referer.
    pub site_url: &'a str,
    /// Pool the rendered path leases handles from.
    pub pool: &'a PagePool,
}

/// A failed execution and the requests it issued.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// Error of the last transport tried.
    pub error: DownloadError,
    /// Requests issued for this URL, navigations and fallback included.
    pub attempts: u32,
}

struct Fetched {
    buffer: Bytes,
    final_url: String,
    headers: HeaderMap,
    transport: Transport,
}

/// Executes downloads over either transport.
pub struct DownloadExecutor {
    http: Arc<dyn LightweightTransport>,
    throttle: Arc<BandwidthThrottle>,
    sink: Arc<dyn ImageSink>,
    locator: Arc<dyn ImageLocator>,
    policy: ContentPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for DownloadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadExecutor")
            .field("throttle", &self.throttle)
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DownloadExecutor {
    /// Creates an executor with the default locator and content policy.
    #[must_use]
    pub fn new(
        http: Arc<dyn LightweightTransport>,
        throttle: Arc<BandwidthThrottle>,
        sink: Arc<dyn ImageSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            throttle,
            sink,
            locator: Arc::new(BestImageLocator),
            policy: ContentPolicy::default(),
            timeout,
        }
    }

    /// Replaces the embedded-image locator.
    #[must_use]
    pub fn with_locator(mut self, locator: Arc<dyn ImageLocator>) -> Self {
        self.locator = locator;
        self
    }

    /// Replaces the content policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ContentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Downloads `url` over `hint` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns the lightweight error after a failed fallback, the lightweight
    /// error for lightweight hints, or [`DownloadError::Critical`] when the
    /// sink reports a critical failure. The failure carries the number of
    /// requests issued before it.
    #[instrument(skip(self, ctx), fields(url = %url, transport = %hint))]
    pub async fn execute(
        &self,
        url: &str,
        hint: Transport,
        ctx: &RunContext<'_>,
    ) -> Result<DownloadResult, ExecutionFailure> {
        let mut attempts = 0_u32;
        let fetched = match self.fetch_and_save(url, hint, ctx, &mut attempts).await {
            Ok(fetched) => fetched,
            Err(error) => return Err(ExecutionFailure { error, attempts }),
        };

        debug!(
            bytes = fetched.buffer.len(),
            attempts,
            via = %fetched.transport,
            "download complete"
        );
        Ok(DownloadResult {
            buffer: fetched.buffer,
            final_url: fetched.final_url,
            headers: fetched.headers,
            transport: fetched.transport,
            attempts,
        })
    }

    async fn fetch_and_save(
        &self,
        url: &str,
        hint: Transport,
        ctx: &RunContext<'_>,
        attempts: &mut u32,
    ) -> Result<Fetched, DownloadError> {
        let fetched = match hint {
            Transport::Lightweight => self.fetch_lightweight(url, ctx, attempts).await?,
            Transport::Rendered => match self.fetch_rendered(url, ctx, attempts).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(error = %e, "rendered transport failed, falling back to lightweight");
                    self.fetch_lightweight(url, ctx, attempts).await?
                }
            },
        };

        self.sink
            .save(&fetched.buffer, url, &fetched.headers)
            .await
            .map_err(|e| e.into_download_error(url))?;
        Ok(fetched)
    }

    async fn fetch_rendered(
        &self,
        url: &str,
        ctx: &RunContext<'_>,
        attempts: &mut u32,
    ) -> Result<Fetched, DownloadError> {
        let mut lease = ctx
            .pool
            .acquire()
            .await
            .map_err(|e| DownloadError::PoolExhausted {
                url: url.to_string(),
                message: e.message,
            })?;
        let result = self.resolve_rendered(url, ctx.pool, &mut lease, attempts).await;
        ctx.pool.release(lease).await;
        result
    }

    async fn resolve_rendered(
        &self,
        url: &str,
        pool: &PagePool,
        lease: &mut Lease<'_>,
        attempts: &mut u32,
    ) -> Result<Fetched, DownloadError> {
        let mut target = url.to_string();
        for depth in 0..=MAX_HTML_RECURSION {
            *attempts += 1;
            let nav = pool
                .navigate(lease, &target, self.timeout)
                .await
                .map_err(|e| provider_error(&target, e))?;

            if nav.status >= 400 {
                return Err(DownloadError::http_status(target, nav.status));
            }

            if is_html(&nav.headers) {
                if depth == MAX_HTML_RECURSION {
                    break;
                }
                let html = String::from_utf8_lossy(&nav.body);
                let next = self
                    .locator
                    .locate(&html, &nav.final_url)
                    .ok_or_else(|| DownloadError::NoEmbeddedImage {
                        url: nav.final_url.clone(),
                    })?;
                debug!(depth = depth + 1, page = %nav.final_url, image = %next, "following embedded image");
                target = next;
                continue;
            }

            if !self.policy.accepts(&nav.headers) {
                return Err(DownloadError::not_an_image(
                    target,
                    content_type(&nav.headers).unwrap_or_default(),
                ));
            }

            self.throttle.consume(nav.body.len()).await;
            return Ok(Fetched {
                buffer: nav.body,
                final_url: nav.final_url,
                headers: nav.headers,
                transport: Transport::Rendered,
            });
        }

        Err(DownloadError::RecursionExceeded {
            url: url.to_string(),
            depth: MAX_HTML_RECURSION,
        })
    }

    async fn fetch_lightweight(
        &self,
        url: &str,
        ctx: &RunContext<'_>,
        attempts: &mut u32,
    ) -> Result<Fetched, DownloadError> {
        *attempts += 1;
        let headers = RequestHeaders::for_site(ctx.site_url);
        let HttpResponse {
            final_url,
            headers,
            mut body,
            ..
        } = self.http.get(url, &headers, self.timeout).await?;

        if is_html(&headers) {
            return Err(DownloadError::not_an_image(
                url,
                content_type(&headers).unwrap_or_default(),
            ));
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.throttle.consume(chunk.len()).await;
            buffer.extend_from_slice(&chunk);
        }

        Ok(Fetched {
            buffer: buffer.freeze(),
            final_url,
            headers,
            transport: Transport::Lightweight,
        })
    }
}

fn provider_error(url: &str, error: ProviderError) -> DownloadError {
    if error.timed_out {
        DownloadError::timeout(url)
    } else {
        DownloadError::navigation(url, error.message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::download::error::SaveError;
    use crate::download::sink::MemorySink;
    use crate::pool::{HandleProvider, PageHealthMonitor, PoolStats};
    use crate::test_support::http::ScriptedHttp;
    use crate::test_support::provider::{Reply, ScriptedProvider};

    const SITE: &str = "https://gallery.example.com/";

    struct Harness {
        provider: Arc<ScriptedProvider>,
        http: Arc<ScriptedHttp>,
        sink: Arc<MemorySink>,
        pool: PagePool,
    }

    impl Harness {
        fn new(provider: ScriptedProvider, http: ScriptedHttp) -> Self {
            let provider = Arc::new(provider);
            let dyn_provider: Arc<dyn HandleProvider> = provider.clone();
            Self {
                pool: PagePool::empty(
                    dyn_provider,
                    PageHealthMonitor::default(),
                    Arc::new(PoolStats::new()),
                ),
                provider,
                http: Arc::new(http),
                sink: Arc::new(MemorySink::new()),
            }
        }

        fn executor(&self) -> DownloadExecutor {
            DownloadExecutor::new(
                self.http.clone(),
                Arc::new(BandwidthThrottle::unlimited()),
                self.sink.clone(),
                Duration::from_secs(5),
            )
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext {
                site_url: SITE,
                pool: &self.pool,
            }
        }
    }

    #[tokio::test]
    async fn test_rendered_image_saved() {
        let harness = Harness::new(
            ScriptedProvider::new().reply("https://a.example/1.jpg", Reply::image(b"jpeg")),
            ScriptedHttp::new(),
        );
        let result = harness
            .executor()
            .execute("https://a.example/1.jpg", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();

        assert_eq!(result.transport, Transport::Rendered);
        assert_eq!(result.attempts, 1);
        assert_eq!(&result.buffer[..], b"jpeg");
        assert_eq!(harness.sink.get("https://a.example/1.jpg").unwrap(), b"jpeg");
        assert_eq!(harness.http.requests(), 0);
        assert_eq!(harness.provider.closed(), 1, "on-demand handle closed");
    }

    #[tokio::test]
    async fn test_html_wrapper_resolved_one_level() {
        let harness = Harness::new(
            ScriptedProvider::new()
                .reply(
                    "https://a.example/view/7",
                    Reply::html(r#"<meta property="og:image" content="/full/7.jpg">"#),
                )
                .reply("https://a.example/full/7.jpg", Reply::image(b"full")),
            ScriptedHttp::new(),
        );
        let result = harness
            .executor()
            .execute("https://a.example/view/7", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.final_url, "https://a.example/full/7.jpg");
        assert_eq!(&result.buffer[..], b"full");
        // persisted under the requested URL
        assert!(harness.sink.get("https://a.example/view/7").is_some());
    }

    #[tokio::test]
    async fn test_recursion_limit() {
        let provider = ScriptedProvider::new()
            .reply("https://a.example/0", Reply::html(r#"<img src="/1">"#))
            .reply("https://a.example/1", Reply::html(r#"<img src="/2">"#))
            .reply("https://a.example/2", Reply::html(r#"<img src="/3">"#))
            .reply("https://a.example/3", Reply::html(r#"<img src="/4">"#));
        let harness = Harness::new(provider, ScriptedHttp::new());
        let executor = harness.executor();
        let ctx = harness.ctx();

        let mut attempts = 0;
        let err = executor
            .fetch_rendered("https://a.example/0", &ctx, &mut attempts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DownloadError::RecursionExceeded { depth: 3, .. }));
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn test_three_levels_still_resolve() {
        let provider = ScriptedProvider::new()
            .reply("https://a.example/0", Reply::html(r#"<img src="/1">"#))
            .reply("https://a.example/1", Reply::html(r#"<img src="/2">"#))
            .reply("https://a.example/2", Reply::html(r#"<img src="/3.jpg">"#))
            .reply("https://a.example/3.jpg", Reply::image(b"deep"));
        let harness = Harness::new(provider, ScriptedHttp::new());
        let result = harness
            .executor()
            .execute("https://a.example/0", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();
        assert_eq!(result.transport, Transport::Rendered);
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn test_rendered_failure_falls_back_to_lightweight() {
        let harness = Harness::new(
            ScriptedProvider::new().reply("https://a.example/x.png", Reply::Timeout),
            ScriptedHttp::new().body("https://a.example/x.png", "image/png", b"via-http"),
        );
        let result = harness
            .executor()
            .execute("https://a.example/x.png", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();

        assert_eq!(result.transport, Transport::Lightweight);
        assert_eq!(result.attempts, 2);
        assert_eq!(&result.buffer[..], b"via-http");
        assert_eq!(harness.http.requests(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_content_falls_back() {
        let harness = Harness::new(
            ScriptedProvider::new().reply(
                "https://a.example/data",
                Reply::Page {
                    status: 200,
                    content_type: "application/json",
                    body: b"{}".to_vec(),
                },
            ),
            ScriptedHttp::new(),
        );
        let result = harness
            .executor()
            .execute("https://a.example/data", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();
        assert_eq!(result.transport, Transport::Lightweight);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_falls_back() {
        let harness = Harness::new(
            ScriptedProvider::new().failing_create(),
            ScriptedHttp::new(),
        );
        let result = harness
            .executor()
            .execute("https://a.example/x.png", Transport::Rendered, &harness.ctx())
            .await
            .unwrap();
        assert_eq!(result.transport, Transport::Lightweight);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_both_transports_fail_surfaces_lightweight_error() {
        let harness = Harness::new(
            ScriptedProvider::new().reply("https://a.example/x.png", Reply::status(502)),
            ScriptedHttp::new().status("https://a.example/x.png", 404),
        );
        let err = harness
            .executor()
            .execute("https://a.example/x.png", Transport::Rendered, &harness.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err.error, DownloadError::HttpStatus { status: 404, .. }));
        assert_eq!(err.attempts, 2, "rendered navigation plus fallback request");
        assert!(harness.sink.is_empty());
    }

    #[tokio::test]
    async fn test_lightweight_rejects_html_without_recursion() {
        let harness = Harness::new(
            ScriptedProvider::new(),
            ScriptedHttp::new().body(
                "https://a.example/page",
                "text/html",
                br#"<img src="/x.jpg">"#,
            ),
        );
        let err = harness
            .executor()
            .execute("https://a.example/page", Transport::Lightweight, &harness.ctx())
            .await
            .unwrap_err();
        assert!(matches!(err.error, DownloadError::NotAnImage { .. }));
        assert_eq!(err.attempts, 1);
        assert_eq!(harness.http.requests(), 1);
        assert_eq!(harness.provider.navigations(), 0);
    }

    #[tokio::test]
    async fn test_lightweight_sends_site_referer() {
        let harness = Harness::new(ScriptedProvider::new(), ScriptedHttp::new());
        harness
            .executor()
            .execute("https://a.example/x.png", Transport::Lightweight, &harness.ctx())
            .await
            .unwrap();
        let referer = harness.http.last_referer.lock().unwrap().clone();
        assert_eq!(referer.as_deref(), Some(SITE));
    }

    #[tokio::test]
    async fn test_failed_html_chain_counts_every_request() {
        let harness = Harness::new(
            ScriptedProvider::new()
                .reply(
                    "https://a.example/view/9",
                    Reply::html(r#"<meta property="og:image" content="/full/9.jpg">"#),
                )
                .reply("https://a.example/full/9.jpg", Reply::status(404)),
            ScriptedHttp::new().status("https://a.example/view/9", 404),
        );
        let err = harness
            .executor()
            .execute("https://a.example/view/9", Transport::Rendered, &harness.ctx())
            .await
            .unwrap_err();
        // wrapper page, embedded image, lightweight fallback
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.error, DownloadError::HttpStatus { status: 404, .. }));
    }

    struct BrokenDisk;

    #[async_trait]
    impl ImageSink for BrokenDisk {
        async fn save(&self, _: &[u8], _: &str, _: &HeaderMap) -> Result<(), SaveError> {
            Err(SaveError::critical("No space left on device", None))
        }
    }

    #[tokio::test]
    async fn test_critical_save_error_propagates() {
        let harness = Harness::new(ScriptedProvider::new(), ScriptedHttp::new());
        let executor = DownloadExecutor::new(
            harness.http.clone(),
            Arc::new(BandwidthThrottle::unlimited()),
            Arc::new(BrokenDisk),
            Duration::from_secs(5),
        );
        let err = executor
            .execute("https://a.example/x.png", Transport::Rendered, &harness.ctx())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        match err.error {
            DownloadError::Critical(critical) => {
                assert_eq!(critical.url, "https://a.example/x.png");
                assert!(critical.reason.contains("No space"));
            }
            other => panic!("expected critical error, got {other:?}"),
        }
        assert_eq!(harness.http.requests(), 0, "no fallback after a successful fetch");
    }
}
