//! Browser page pool: handles, health, strategy selection and preloading.
//!
//! # Strategies
//!
//! - [`PoolStrategy::Reuse`]: one pool sized to the first wave's rendered
//!   downloads is opened up front and cycled round-robin across all waves.
//!   Handles are health-checked before each use and recycled in place.
//! - [`PoolStrategy::Progressive`]: each wave gets its own pool, closed when
//!   the wave ends. The [`ProgressivePreloader`] opens the next wave's handles
//!   while the current wave downloads.
//!
//! [`PagePoolScheduler`] picks the strategy once per run.

use std::fmt;

use serde::Serialize;

mod handle;
mod health;
mod memory;
mod metrics;
mod preloader;
mod scheduler;
mod score;
mod slots;

pub use handle::{
    DisabledProvider, HandleId, HandleMetrics, HandleProvider, HandleState, Navigation,
    ProviderError, ResourceHandle,
};
pub use health::{HealthVerdict, PageHealthMonitor, UnhealthyReason};
pub use memory::{MemoryProbe, MemorySnapshot, StaticMemoryProbe, SystemMemoryProbe};
pub use metrics::{PoolMetrics, PoolStats};
pub use preloader::ProgressivePreloader;
pub use scheduler::{PagePoolScheduler, StrategyDecision, StrategyReason, strategy_for_score};
pub use score::{LoadEstimate, pws_score};
pub use slots::{Lease, PagePool};

pub(crate) use scheduler::rendered_count;

/// How resource handles are created and retired during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
    /// One long-lived pool cycled across waves.
    Reuse,
    /// A fresh pool per wave, preloaded while the previous wave runs.
    Progressive,
}

impl fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse => f.write_str("reuse"),
            Self::Progressive => f.write_str("progressive"),
        }
    }
}
