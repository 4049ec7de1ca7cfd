//! Process-wide bandwidth throttle for download streams.
//!
//! One [`BandwidthThrottle`] is constructed per process and shared (via `Arc`)
//! by every concurrent download. Each received chunk is charged against a
//! token bucket measured in bytes, so the aggregate throughput of all
//! transfers stays under the configured cap.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use harvest_core::download::BandwidthThrottle;
//!
//! # async fn example() {
//! // 512 KiB/s shared by all downloads
//! let throttle = Arc::new(BandwidthThrottle::new(512));
//! throttle.consume(64 * 1024).await;
//!
//! // 0 disables throttling
//! let unlimited = BandwidthThrottle::new(0);
//! assert!(unlimited.is_unlimited());
//! # }
//! ```

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, instrument, warn};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared byte-rate limiter.
///
/// `BandwidthThrottle` is `Send + Sync`; waiting for capacity suspends only
/// the calling task.
pub struct BandwidthThrottle {
    /// `None` when throttling is disabled.
    limiter: Option<DirectLimiter>,
    /// Configured rate in bytes per second (0 when disabled).
    bytes_per_sec: u32,
    /// Largest single charge the bucket can hold.
    max_charge: NonZeroU32,
    /// Total bytes charged so far.
    charged_bytes: AtomicU64,
}

impl fmt::Debug for BandwidthThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthThrottle")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .field("unlimited", &self.is_unlimited())
            .field("charged_bytes", &self.charged_bytes())
            .finish()
    }
}

impl BandwidthThrottle {
    /// Creates a throttle capped at `limit_kbps` KiB/s.
    ///
    /// A limit of 0 creates an unlimited throttle.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(limit_kbps: u64) -> Self {
        let bytes_per_sec = u32::try_from(limit_kbps.saturating_mul(1024)).unwrap_or(u32::MAX);
        let Some(rate) = NonZeroU32::new(bytes_per_sec) else {
            return Self::unlimited();
        };

        debug!(bytes_per_sec, "creating bandwidth throttle");
        Self {
            limiter: Some(RateLimiter::direct(Quota::per_second(rate))),
            bytes_per_sec,
            max_charge: rate,
            charged_bytes: AtomicU64::new(0),
        }
    }

    /// Creates a throttle that never waits.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            bytes_per_sec: 0,
            max_charge: NonZeroU32::MIN,
            charged_bytes: AtomicU64::new(0),
        }
    }

    /// Returns whether throttling is disabled.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Configured rate in bytes per second, `None` when unlimited.
    #[must_use]
    pub fn bytes_per_sec(&self) -> Option<u32> {
        (!self.is_unlimited()).then_some(self.bytes_per_sec)
    }

    /// Total bytes that passed through the throttle.
    #[must_use]
    pub fn charged_bytes(&self) -> u64 {
        self.charged_bytes.load(Ordering::Relaxed)
    }

    /// Waits until `bytes` may be delivered.
    ///
    /// Charges larger than one second of capacity are split so the bucket
    /// can always satisfy them.
    pub async fn consume(&self, bytes: usize) {
        self.charged_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);

        let Some(limiter) = &self.limiter else {
            return;
        };

        let mut remaining = u32::try_from(bytes).unwrap_or(u32::MAX);
        while let Some(step) = NonZeroU32::new(remaining.min(self.max_charge.get())) {
            if let Err(e) = limiter.until_n_ready(step).await {
                // Unreachable while step <= max_charge; never stall the download on it.
                warn!(error = %e, bytes = step.get(), "bandwidth charge exceeds bucket capacity");
                return;
            }
            remaining -= step.get();
        }
    }
}
