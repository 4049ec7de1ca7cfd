//! In-memory [`HandleProvider`] standing in for a real browser.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use harvest_core::DownloadError;
use harvest_core::download::{HttpResponse, LightweightTransport, RequestHeaders};
use harvest_core::pool::{
    HandleId, HandleMetrics, HandleProvider, Navigation, ProviderError, ResourceHandle,
};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

#[derive(Debug, Clone)]
struct Page {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

/// Serves a JPEG for every URL unless a page is registered for it.
#[derive(Debug, Default)]
pub struct FakeBrowser {
    pages: Mutex<HashMap<String, Page>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    closed: AtomicUsize,
    navigations: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn page(self, url: &str, status: u16, content_type: &'static str, body: &[u8]) -> Self {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            Page {
                status,
                content_type,
                body: body.to_vec(),
            },
        );
        self
    }

    pub fn html(self, url: &str, html: &str) -> Self {
        self.page(url, 200, "text/html; charset=utf-8", html.as_bytes())
    }

    pub fn image(self, url: &str, body: &[u8]) -> Self {
        self.page(url, 200, "image/jpeg", body)
    }

    pub fn status(self, url: &str, status: u16) -> Self {
        self.page(url, status, "text/plain", b"")
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.created() - self.closed()
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleProvider for FakeBrowser {
    async fn create_handle(&self) -> Result<ResourceHandle, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ResourceHandle::new(HandleId(id)))
    }

    async fn close_handle(&self, _handle: ResourceHandle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn navigate(
        &self,
        _handle: &ResourceHandle,
        url: &str,
        _timeout: Duration,
    ) -> Result<Navigation, ProviderError> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let page = self.pages.lock().unwrap().get(url).cloned().unwrap_or(Page {
            status: 200,
            content_type: "image/jpeg",
            body: b"fake-jpeg".to_vec(),
        });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(page.content_type));
        Ok(Navigation {
            status: page.status,
            headers,
            body: Bytes::from(page.body),
            final_url: url.to_string(),
        })
    }

    async fn metrics(&self, _handle: &ResourceHandle) -> Option<HandleMetrics> {
        Some(HandleMetrics { heap_used_mb: 12.0 })
    }
}

/// Lightweight transport for offline runs: every URL answers 404.
#[derive(Debug, Default)]
pub struct OfflineHttp {
    requests: AtomicUsize,
}

impl OfflineHttp {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LightweightTransport for OfflineHttp {
    async fn get(
        &self,
        url: &str,
        _headers: &RequestHeaders,
        _timeout: Duration,
    ) -> Result<HttpResponse, DownloadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(DownloadError::http_status(url, 404))
    }
}
