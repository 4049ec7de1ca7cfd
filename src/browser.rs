//! Headless Chromium resource-handle provider (feature `browser`).
//!
//! Each [`ResourceHandle`] maps to one browser tab. Navigation loads the URL
//! in the tab itself. Documents are returned as their rendered DOM; images
//! (and other binary responses) are read back with a same-origin `fetch()`
//! from the navigated tab, served from the browser cache, base64-encoded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chromiumoxide::{Browser, BrowserConfig, Page};
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::download::constants::DEFAULT_USER_AGENT;
use crate::pool::{HandleId, HandleMetrics, HandleProvider, Navigation, ProviderError, ResourceHandle};

/// Launch options for [`ChromiumProvider`].
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    /// Run without a window.
    pub headless: bool,
    /// Chrome/Chromium binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    /// Page each new tab opens first, usually the site being harvested.
    pub context_url: Option<String>,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            context_url: None,
        }
    }
}

/// State of a tab right after navigation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageSnapshot {
    /// Main response status; 0 when the browser does not expose it.
    #[serde(default)]
    status: u16,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    url: Option<String>,
}

/// Where the navigation body is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodySource {
    /// Serialized DOM after scripts ran.
    RenderedDom,
    /// Raw response bytes.
    ResponseBytes,
}

impl PageSnapshot {
    fn body_source(&self) -> BodySource {
        let mime = self.content_type.trim().to_ascii_lowercase();
        if mime.is_empty() || mime.starts_with("text/html") || mime.contains("xhtml") {
            BodySource::RenderedDom
        } else {
            BodySource::ResponseBytes
        }
    }

    /// Status to report; an unexposed status is treated as a loaded page.
    fn effective_status(&self) -> u16 {
        if self.status == 0 { 200 } else { self.status }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mime = if self.content_type.is_empty() {
            "text/html"
        } else {
            self.content_type.as_str()
        };
        if let Ok(value) = HeaderValue::from_str(mime) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    data: String,
}

impl FetchResult {
    fn into_parts(self) -> Result<(u16, HeaderMap, Vec<u8>), ProviderError> {
        if let Some(error) = self.error {
            return Err(ProviderError::new(format!("reading response body failed: {error}")));
        }
        let body = base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ProviderError::new(format!("invalid body encoding: {e}")))?;
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        Ok((self.status, headers, body))
    }
}

/// [`HandleProvider`] backed by a local headless Chromium.
pub struct ChromiumProvider {
    browser: Browser,
    handler: JoinHandle<()>,
    pages: DashMap<HandleId, Page>,
    next_id: AtomicU64,
    context_url: String,
}

impl std::fmt::Debug for ChromiumProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumProvider")
            .field("open_pages", &self.pages.len())
            .field("context_url", &self.context_url)
            .finish_non_exhaustive()
    }
}

impl ChromiumProvider {
    /// Launches the browser.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the config is invalid or Chromium fails
    /// to start.
    pub async fn launch(options: ChromiumOptions) -> Result<Self, ProviderError> {
        info!(headless = options.headless, "launching browser");

        let mut builder = BrowserConfig::builder();
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg(format!("--user-agent={DEFAULT_USER_AGENT}"))
            .build()
            .map_err(|e| ProviderError::new(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ProviderError::new(format!("failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            pages: DashMap::new(),
            next_id: AtomicU64::new(1),
            context_url: options
                .context_url
                .unwrap_or_else(|| "about:blank".to_string()),
        })
    }

    /// Tabs currently open.
    #[must_use]
    pub fn open_pages(&self) -> usize {
        self.pages.len()
    }

    /// Closes all tabs and the browser.
    pub async fn close(mut self) {
        let ids: Vec<HandleId> = self.pages.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, page)) = self.pages.remove(&id) {
                let _ = page.close().await;
            }
        }
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser did not close cleanly");
        }
        self.handler.abort();
    }

    fn page(&self, handle: &ResourceHandle) -> Result<Page, ProviderError> {
        self.pages
            .get(&handle.id())
            .map(|p| p.clone())
            .ok_or_else(|| ProviderError::new(format!("{} is closed", handle.id())))
    }
}

#[async_trait]
impl HandleProvider for ChromiumProvider {
    async fn create_handle(&self) -> Result<ResourceHandle, ProviderError> {
        let page = self
            .browser
            .new_page(self.context_url.as_str())
            .await
            .map_err(|e| ProviderError::new(format!("failed to open page: {e}")))?;
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pages.insert(id, page);
        debug!(handle = %id, "page opened");
        Ok(ResourceHandle::new(id))
    }

    async fn close_handle(&self, handle: ResourceHandle) {
        if let Some((id, page)) = self.pages.remove(&handle.id()) {
            if let Err(e) = page.close().await {
                warn!(handle = %id, error = %e, "page did not close cleanly");
            }
        }
    }

    async fn navigate(
        &self,
        handle: &ResourceHandle,
        url: &str,
        timeout: Duration,
    ) -> Result<Navigation, ProviderError> {
        let page = self.page(handle)?;

        tokio::time::timeout(timeout, page.goto(url))
            .await
            .map_err(|_| ProviderError::timeout(format!("navigation to {url} timed out")))?
            .map_err(|e| ProviderError::new(format!("navigation to {url} failed: {e}")))?;

        let snapshot: PageSnapshot = page
            .evaluate(SNAPSHOT_SCRIPT)
            .await
            .map_err(|e| ProviderError::new(format!("page inspection failed: {e}")))?
            .into_value()
            .map_err(|e| ProviderError::new(format!("unexpected page state: {e}")))?;
        let final_url = snapshot.url.clone().unwrap_or_else(|| url.to_string());

        let (status, headers, body) = match snapshot.body_source() {
            BodySource::RenderedDom => {
                let html = page
                    .content()
                    .await
                    .map_err(|e| ProviderError::new(format!("reading DOM failed: {e}")))?;
                (snapshot.effective_status(), snapshot.headers(), html.into_bytes())
            }
            BodySource::ResponseBytes => {
                let script = cached_body_script(&final_url)?;
                let result: FetchResult = tokio::time::timeout(timeout, page.evaluate(script))
                    .await
                    .map_err(|_| ProviderError::timeout(format!("reading {url} timed out")))?
                    .map_err(|e| ProviderError::new(format!("page script failed: {e}")))?
                    .into_value()
                    .map_err(|e| ProviderError::new(format!("unexpected body result: {e}")))?;
                let (status, mut headers, body) = result.into_parts()?;
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.extend(snapshot.headers());
                }
                let status = if status == 0 { snapshot.effective_status() } else { status };
                (status, headers, body)
            }
        };
        debug!(url = %url, status, bytes = body.len(), "navigation complete");

        Ok(Navigation {
            status,
            headers,
            body: Bytes::from(body),
            final_url,
        })
    }

    async fn metrics(&self, handle: &ResourceHandle) -> Option<HandleMetrics> {
        let page = self.page(handle).ok()?;
        let metrics = page.metrics().await.ok()?;
        metrics
            .iter()
            .find(|m| m.name == "JSHeapUsedSize")
            .map(|m| HandleMetrics {
                heap_used_mb: m.value / (1024.0 * 1024.0),
            })
    }
}

/// Status, MIME type and URL of the loaded document.
const SNAPSHOT_SCRIPT: &str = r"
(() => {
    const nav = performance.getEntriesByType('navigation')[0];
    return {
        status: nav && nav.responseStatus ? nav.responseStatus : 0,
        contentType: document.contentType || '',
        url: location.href
    };
})()
";

/// Reads the body of the URL the tab just loaded. The tab is on the same
/// origin, so no CORS applies, and the cache avoids a second download.
fn cached_body_script(url: &str) -> Result<String, ProviderError> {
    let quoted = serde_json::to_string(url)
        .map_err(|e| ProviderError::new(format!("cannot quote url: {e}")))?;
    Ok(format!(
        r"
        (async () => {{
            try {{
                const response = await fetch({quoted}, {{
                    method: 'GET',
                    credentials: 'include',
                    cache: 'force-cache'
                }});
                const bytes = new Uint8Array(await response.arrayBuffer());
                let binary = '';
                for (let i = 0; i < bytes.length; i += 0x8000) {{
                    binary += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
                }}
                return {{
                    status: response.status,
                    headers: Object.fromEntries(response.headers.entries()),
                    data: btoa(binary)
                }};
            }} catch (e) {{
                return {{ error: e.toString() }};
            }}
        }})()
        "
    ))
}
