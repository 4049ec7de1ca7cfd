//! Next-wave handle preparation for the `progressive` strategy.
//!
//! The coordinator runs [`ProgressivePreloader::preload`] alongside the current
//! wave's downloads and awaits both before advancing, so opening pages for
//! wave `n + 1` overlaps with downloading wave `n`.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, instrument, warn};

use super::handle::{HandleProvider, ResourceHandle};
use super::metrics::PoolStats;
use super::scheduler::rendered_count;
use crate::download::TransportSelector;

/// Opens handles for the next wave.
pub struct ProgressivePreloader {
    provider: Arc<dyn HandleProvider>,
    selector: TransportSelector,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for ProgressivePreloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressivePreloader").finish_non_exhaustive()
    }
}

impl ProgressivePreloader {
    /// Creates a preloader.
    #[must_use]
    pub fn new(
        provider: Arc<dyn HandleProvider>,
        selector: TransportSelector,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self {
            provider,
            selector,
            stats,
        }
    }

    /// Opens one handle per rendered download in `next_wave_urls`.
    ///
    /// If any handle fails to open, the ones already opened are closed and an
    /// empty set is returned; the wave then creates its handles on demand.
    #[instrument(skip(self, next_wave_urls), fields(urls = next_wave_urls.len()))]
    pub async fn preload(&self, next_wave_urls: &[String], site_url: &str) -> Vec<ResourceHandle> {
        let needed = rendered_count(&self.selector, next_wave_urls, site_url);
        if needed == 0 {
            return Vec::new();
        }

        let results = join_all((0..needed).map(|_| self.provider.create_handle())).await;
        let mut handles = Vec::with_capacity(needed);
        let mut failure = None;
        for result in results {
            match result {
                Ok(handle) => {
                    self.stats.record_created();
                    handles.push(handle);
                }
                Err(e) => failure = Some(e),
            }
        }

        if let Some(e) = failure {
            warn!(error = %e, opened = handles.len(), needed, "preload failed; next wave creates handles on demand");
            self.discard(handles).await;
            return Vec::new();
        }

        debug!(count = handles.len(), "next wave preloaded");
        handles
    }

    /// Closes handles that will not be used.
    pub async fn discard(&self, handles: Vec<ResourceHandle>) {
        for handle in handles {
            self.provider.close_handle(handle).await;
            self.stats.record_closed();
        }
    }
}
