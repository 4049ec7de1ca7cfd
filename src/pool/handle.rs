//! Resource handles and the provider that owns the underlying pages.
//!
//! A [`ResourceHandle`] is an opaque ticket for one browser-rendered context.
//! The real page lives inside the [`HandleProvider`]; the handle only carries
//! the counters the health monitor needs. Closing a handle consumes it, so a
//! closed handle can never be used again.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use thiserror::Error;

/// Provider-assigned handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Lifecycle state of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created, not used yet.
    Created,
    /// Served at least one navigation and passed its last health check.
    Healthy,
    /// Failed a health check; must be closed and replaced.
    Unhealthy,
}

/// One browser-rendered execution context.
#[derive(Debug)]
pub struct ResourceHandle {
    id: HandleId,
    reuse_count: u32,
    consecutive_server_errors: u32,
    observed_heap_mb: f64,
    created_at: Instant,
    state: HandleState,
}

impl ResourceHandle {
    /// Creates a fresh handle; called by providers.
    #[must_use]
    pub fn new(id: HandleId) -> Self {
        Self {
            id,
            reuse_count: 0,
            consecutive_server_errors: 0,
            observed_heap_mb: 0.0,
            created_at: Instant::now(),
            state: HandleState::Created,
        }
    }

    /// Handle identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Number of navigations served.
    #[must_use]
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count
    }

    /// Consecutive 5xx responses since the last non-5xx one.
    #[must_use]
    pub fn consecutive_server_errors(&self) -> u32 {
        self.consecutive_server_errors
    }

    /// Last observed JS heap in MB (0 when never measured).
    #[must_use]
    pub fn observed_heap_mb(&self) -> f64 {
        self.observed_heap_mb
    }

    /// Creation instant.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }

    pub(crate) fn record_heap(&mut self, heap_mb: f64) {
        if heap_mb.is_finite() && heap_mb >= 0.0 {
            self.observed_heap_mb = heap_mb;
        }
    }

    pub(crate) fn record_use(&mut self, is_server_error: bool) {
        self.reuse_count = self.reuse_count.saturating_add(1);
        if is_server_error {
            self.consecutive_server_errors = self.consecutive_server_errors.saturating_add(1);
        } else {
            self.consecutive_server_errors = 0;
        }
    }

    pub(crate) fn set_state(&mut self, state: HandleState) {
        self.state = state;
    }
}

/// Response of a rendered navigation.
#[derive(Debug, Clone)]
pub struct Navigation {
    /// HTTP status of the main response.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// URL after redirects.
    pub final_url: String,
}

/// Live metrics of a handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandleMetrics {
    /// Used JS heap in MB.
    pub heap_used_mb: f64,
}

/// Failure reported by a [`HandleProvider`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable reason.
    pub message: String,
    /// Whether the operation ran out of time.
    pub timed_out: bool,
}

impl ProviderError {
    /// A generic provider failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    /// A timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }
}

/// Browser automation collaborator.
///
/// Implementations map [`HandleId`]s to their real pages.
#[async_trait]
pub trait HandleProvider: Send + Sync {
    /// Opens a new rendered context.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the browser cannot open a page.
    async fn create_handle(&self) -> Result<ResourceHandle, ProviderError>;

    /// Closes a handle. Errors are logged by the provider, never returned.
    async fn close_handle(&self, handle: ResourceHandle);

    /// Loads `url` in the handle's context and returns the main response.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on navigation failure or timeout.
    async fn navigate(
        &self,
        handle: &ResourceHandle,
        url: &str,
        timeout: Duration,
    ) -> Result<Navigation, ProviderError>;

    /// Best-effort live metrics; `None` when unavailable.
    async fn metrics(&self, handle: &ResourceHandle) -> Option<HandleMetrics>;
}

/// Provider used when no browser is available.
///
/// Every handle creation fails, so rendered downloads fall back to the
/// lightweight transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProvider;

#[async_trait]
impl HandleProvider for DisabledProvider {
    async fn create_handle(&self) -> Result<ResourceHandle, ProviderError> {
        Err(ProviderError::new("rendered transport is not available"))
    }

    async fn close_handle(&self, _handle: ResourceHandle) {}

    async fn navigate(
        &self,
        handle: &ResourceHandle,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Navigation, ProviderError> {
        Err(ProviderError::new(format!("{} has no page", handle.id())))
    }

    async fn metrics(&self, _handle: &ResourceHandle) -> Option<HandleMetrics> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_starts_clean() {
        let handle = ResourceHandle::new(HandleId(7));
        assert_eq!(handle.id(), HandleId(7));
        assert_eq!(handle.reuse_count(), 0);
        assert_eq!(handle.consecutive_server_errors(), 0);
        assert_eq!(handle.state(), HandleState::Created);
        assert_eq!(handle.id().to_string(), "handle-7");
    }

    #[test]
    fn test_record_use_resets_on_non_server_error() {
        let mut handle = ResourceHandle::new(HandleId(1));
        handle.record_use(true);
        handle.record_use(true);
        assert_eq!(handle.consecutive_server_errors(), 2);
        handle.record_use(false);
        assert_eq!(handle.consecutive_server_errors(), 0);
        assert_eq!(handle.reuse_count(), 3);
    }

    #[test]
    fn test_record_heap_ignores_invalid_values() {
        let mut handle = ResourceHandle::new(HandleId(1));
        handle.record_heap(120.5);
        handle.record_heap(f64::NAN);
        handle.record_heap(-1.0);
        assert!((handle.observed_heap_mb() - 120.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_disabled_provider_refuses_handles() {
        let err = DisabledProvider.create_handle().await.unwrap_err();
        assert!(!err.timed_out);
        assert!(err.message.contains("not available"));
    }
}
