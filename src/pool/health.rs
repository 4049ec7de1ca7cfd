//! Health verdicts for reused resource handles.

use std::fmt;

use tracing::debug;

use super::handle::{HandleState, ResourceHandle};
use crate::config::ReuseConfig;

/// Why a handle must be retired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnhealthyReason {
    /// Served more navigations than allowed.
    ReuseExceeded {
        /// Navigations served.
        count: u32,
        /// Configured limit.
        max: u32,
    },
    /// JS heap above the limit.
    HeapExceeded {
        /// Observed heap in MB.
        heap_mb: f64,
        /// Configured limit in MB.
        max_mb: f64,
    },
    /// Too many 5xx responses in a row.
    ServerErrors {
        /// Consecutive 5xx responses.
        count: u32,
        /// Configured limit.
        max: u32,
    },
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReuseExceeded { count, max } => write!(f, "reused {count} times (max {max})"),
            Self::HeapExceeded { heap_mb, max_mb } => {
                write!(f, "heap {heap_mb:.1} MB (max {max_mb:.1} MB)")
            }
            Self::ServerErrors { count, max } => {
                write!(f, "{count} consecutive server errors (max {max})")
            }
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthVerdict {
    /// The handle may serve another navigation.
    Healthy,
    /// The handle must be closed and replaced.
    Unhealthy(UnhealthyReason),
}

impl HealthVerdict {
    /// Returns true for [`HealthVerdict::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Applies [`ReuseConfig`] limits to handles.
#[derive(Debug, Clone, Copy)]
pub struct PageHealthMonitor {
    limits: ReuseConfig,
}

impl Default for PageHealthMonitor {
    fn default() -> Self {
        Self::new(ReuseConfig::default())
    }
}

impl PageHealthMonitor {
    /// Creates a monitor with the given limits.
    #[must_use]
    pub fn new(limits: ReuseConfig) -> Self {
        Self { limits }
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> &ReuseConfig {
        &self.limits
    }

    /// Checks reuse count, then heap, then consecutive server errors.
    #[must_use]
    pub fn check(&self, handle: &ResourceHandle) -> HealthVerdict {
        let limits = &self.limits;
        if handle.reuse_count() > limits.max_reuse {
            return HealthVerdict::Unhealthy(UnhealthyReason::ReuseExceeded {
                count: handle.reuse_count(),
                max: limits.max_reuse,
            });
        }
        if handle.observed_heap_mb() > limits.max_heap_mb {
            return HealthVerdict::Unhealthy(UnhealthyReason::HeapExceeded {
                heap_mb: handle.observed_heap_mb(),
                max_mb: limits.max_heap_mb,
            });
        }
        if handle.consecutive_server_errors() >= limits.max_consecutive_errors {
            return HealthVerdict::Unhealthy(UnhealthyReason::ServerErrors {
                count: handle.consecutive_server_errors(),
                max: limits.max_consecutive_errors,
            });
        }
        HealthVerdict::Healthy
    }

    /// Records one use of `handle` and refreshes its state.
    ///
    /// A 5xx response increments the server-error counter; any other
    /// outcome resets it.
    pub fn update(&self, handle: &mut ResourceHandle, success: bool, is_server_error: bool) {
        handle.record_use(is_server_error);
        let verdict = self.check(handle);
        let state = match verdict {
            HealthVerdict::Unhealthy(_) => HandleState::Unhealthy,
            HealthVerdict::Healthy if success => HandleState::Healthy,
            HealthVerdict::Healthy => handle.state(),
        };
        handle.set_state(state);
        debug!(
            handle = %handle.id(),
            reuse_count = handle.reuse_count(),
            server_errors = handle.consecutive_server_errors(),
            success,
            healthy = verdict.is_healthy(),
            "handle updated"
        );
    }
}
