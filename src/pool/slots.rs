//! Slot-based page pool.
//!
//! Each slot holds at most one [`ResourceHandle`] and is guarded by its own
//! mutex, so a handle serves one download at a time. Slots are handed out
//! round-robin; when every slot is busy (or the pool has none) a temporary
//! handle is created on demand and closed after use, so acquiring never waits
//! on another download.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use super::handle::{HandleProvider, Navigation, ProviderError, ResourceHandle};
use super::health::{HealthVerdict, PageHealthMonitor};
use super::metrics::PoolStats;

/// Exclusive use of one handle for one download.
///
/// Hand it back through [`PagePool::release`]; a dropped lease leaves its
/// slot empty and the slot gets a fresh handle on the next acquire.
#[derive(Debug)]
pub struct Lease<'a> {
    handle: ResourceHandle,
    slot: Option<(usize, MutexGuard<'a, Option<ResourceHandle>>)>,
}

impl Lease<'_> {
    /// The leased handle.
    #[must_use]
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Slot index, `None` for an on-demand handle.
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        self.slot.as_ref().map(|(index, _)| *index)
    }
}

/// Fixed set of handle slots plus on-demand overflow.
pub struct PagePool {
    provider: Arc<dyn HandleProvider>,
    health: PageHealthMonitor,
    stats: Arc<PoolStats>,
    slots: Vec<Mutex<Option<ResourceHandle>>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("slots", &self.slots.len())
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl PagePool {
    /// A pool without slots; every acquire creates an on-demand handle.
    #[must_use]
    pub fn empty(
        provider: Arc<dyn HandleProvider>,
        health: PageHealthMonitor,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self::from_handles(provider, health, stats, Vec::new())
    }

    /// A pool with one slot per handle.
    #[must_use]
    pub fn from_handles(
        provider: Arc<dyn HandleProvider>,
        health: PageHealthMonitor,
        stats: Arc<PoolStats>,
        handles: Vec<ResourceHandle>,
    ) -> Self {
        Self {
            provider,
            health,
            stats,
            slots: handles.into_iter().map(|h| Mutex::new(Some(h))).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Creates `size` slots, opening their handles concurrently.
    ///
    /// Slots whose handle could not be opened start empty and are filled on
    /// first use.
    #[instrument(skip(provider, health, stats))]
    pub async fn fill(
        provider: Arc<dyn HandleProvider>,
        health: PageHealthMonitor,
        stats: Arc<PoolStats>,
        size: usize,
    ) -> Self {
        let results = join_all((0..size).map(|_| provider.create_handle())).await;
        let mut ready = 0_usize;
        let slots: Vec<_> = results
            .into_iter()
            .map(|result| match result {
                Ok(handle) => {
                    stats.record_created();
                    ready += 1;
                    Mutex::new(Some(handle))
                }
                Err(e) => {
                    warn!(error = %e, "could not open pool handle; slot starts empty");
                    Mutex::new(None)
                }
            })
            .collect();
        info!(size, ready, "page pool created");

        Self {
            provider,
            health,
            stats,
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Health monitor applied before each use.
    #[must_use]
    pub fn health(&self) -> &PageHealthMonitor {
        &self.health
    }

    /// Leases a healthy handle.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] only when a new handle is needed and the
    /// provider cannot open one.
    pub async fn acquire(&self) -> Result<Lease<'_>, ProviderError> {
        let count = self.slots.len();
        if count > 0 {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..count {
                let index = (start + offset) % count;
                let Ok(mut guard) = self.slots[index].try_lock() else {
                    continue;
                };
                let handle = match guard.take() {
                    Some(handle) => self.ensure_healthy(handle).await?,
                    None => self.create().await?,
                };
                debug!(slot = index, handle = %handle.id(), "slot leased");
                return Ok(Lease {
                    handle,
                    slot: Some((index, guard)),
                });
            }
        }

        let handle = self.create().await?;
        self.stats.record_on_demand();
        debug!(handle = %handle.id(), "on-demand handle created");
        Ok(Lease { handle, slot: None })
    }

    /// Navigates the leased handle and records the outcome on it.
    ///
    /// # Errors
    ///
    /// Returns the provider's navigation error.
    pub async fn navigate(
        &self,
        lease: &mut Lease<'_>,
        url: &str,
        timeout: Duration,
    ) -> Result<Navigation, ProviderError> {
        let result = self.provider.navigate(&lease.handle, url, timeout).await;
        let (success, server_error) = match &result {
            Ok(nav) => (nav.status < 400, (500..600).contains(&nav.status)),
            Err(_) => (false, false),
        };
        self.health.update(&mut lease.handle, success, server_error);
        result
    }

    /// Returns a lease: slot handles go back to their slot, on-demand
    /// handles are closed.
    pub async fn release(&self, lease: Lease<'_>) {
        let Lease { handle, slot } = lease;
        match slot {
            Some((_, mut guard)) => *guard = Some(handle),
            None => self.close(handle).await,
        }
    }

    /// Closes every idle handle; returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in &self.slots {
            let handle = slot.lock().await.take();
            if let Some(handle) = handle {
                self.close(handle).await;
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "page pool closed");
        }
        closed
    }

    async fn ensure_healthy(&self, mut handle: ResourceHandle) -> Result<ResourceHandle, ProviderError> {
        if let Some(metrics) = self.provider.metrics(&handle).await {
            handle.record_heap(metrics.heap_used_mb);
        }
        match self.health.check(&handle) {
            HealthVerdict::Healthy => Ok(handle),
            HealthVerdict::Unhealthy(reason) => {
                info!(handle = %handle.id(), %reason, "recycling unhealthy handle");
                self.close(handle).await;
                self.stats.record_recycled();
                self.create().await
            }
        }
    }

    async fn create(&self) -> Result<ResourceHandle, ProviderError> {
        let handle = self.provider.create_handle().await?;
        self.stats.record_created();
        Ok(handle)
    }

    async fn close(&self, handle: ResourceHandle) {
        self.provider.close_handle(handle).await;
        self.stats.record_closed();
    }
}
