//! Scripted [`HandleProvider`] for pool and executor tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

use crate::pool::{HandleId, HandleMetrics, HandleProvider, Navigation, ProviderError, ResourceHandle};

/// Canned reply for one URL.
#[derive(Debug, Clone)]
pub enum Reply {
    Page {
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
    },
    Fail(&'static str),
    Timeout,
}

impl Reply {
    pub fn image(body: &[u8]) -> Self {
        Self::Page {
            status: 200,
            content_type: "image/jpeg",
            body: body.to_vec(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self::Page {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Page {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<HashMap<String, Reply>>,
    fail_create: Mutex<bool>,
    heap_mb: Mutex<Option<f64>>,
    next_id: AtomicU64,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub navigations: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    nav_delay: Mutex<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, url: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(url.to_string(), reply);
        self
    }

    pub fn failing_create(self) -> Self {
        *self
            .fail_create
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        self
    }

    pub fn with_heap_mb(self, heap_mb: f64) -> Self {
        *self
            .heap_mb
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(heap_mb);
        self
    }

    pub fn with_nav_delay(self, delay: Duration) -> Self {
        *self
            .nav_delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleProvider for ScriptedProvider {
    async fn create_handle(&self) -> Result<ResourceHandle, ProviderError> {
        let fail = *self
            .fail_create
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if fail {
            return Err(ProviderError::new("browser crashed"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
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
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self
            .nav_delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(url)
            .cloned()
            .unwrap_or_else(|| Reply::image(b"default-image"));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Page {
                status,
                content_type,
                body,
            } => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                Ok(Navigation {
                    status,
                    headers,
                    body: Bytes::from(body),
                    final_url: url.to_string(),
                })
            }
            Reply::Fail(message) => Err(ProviderError::new(message)),
            Reply::Timeout => Err(ProviderError::timeout("navigation timed out")),
        }
    }

    async fn metrics(&self, _handle: &ResourceHandle) -> Option<HandleMetrics> {
        self.heap_mb
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .map(|heap_used_mb| HandleMetrics { heap_used_mb })
    }
}
