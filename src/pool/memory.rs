//! Live memory readings used for strategy selection and run metrics.

use async_trait::async_trait;
use tracing::debug;

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    /// Total system memory in MB.
    pub total_mb: f64,
    /// Memory available to new allocations in MB.
    pub available_mb: f64,
    /// Resident set size of this process in MB, when known.
    pub process_rss_mb: Option<f64>,
}

impl MemorySnapshot {
    /// Available / total, in `0.0..=1.0`.
    #[must_use]
    pub fn free_ratio(&self) -> Option<f64> {
        (self.total_mb > 0.0).then(|| (self.available_mb / self.total_mb).clamp(0.0, 1.0))
    }

    /// Memory in use: process RSS when known, otherwise system-wide usage.
    #[must_use]
    pub fn used_mb(&self) -> f64 {
        self.process_rss_mb
            .unwrap_or((self.total_mb - self.available_mb).max(0.0))
    }
}

/// Source of live memory readings.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// Current reading, `None` when the platform gives no data.
    async fn snapshot(&self) -> Option<MemorySnapshot>;
}

/// Reads `/proc/meminfo` and `/proc/self/status`.
///
/// Linux only. On macOS, Windows and other platforms without procfs every
/// snapshot is `None`, so the free-memory check in strategy selection never
/// forces `progressive` there; pin a ratio with [`StaticMemoryProbe`]
/// (`--assume-free-memory` on the CLI) instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

#[async_trait]
impl MemoryProbe for SystemMemoryProbe {
    async fn snapshot(&self) -> Option<MemorySnapshot> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        let total_kb = kb_field(&meminfo, "MemTotal:")?;
        let available_kb =
            kb_field(&meminfo, "MemAvailable:").or_else(|| kb_field(&meminfo, "MemFree:"))?;

        let process_rss_mb = tokio::fs::read_to_string("/proc/self/status")
            .await
            .ok()
            .and_then(|status| kb_field(&status, "VmRSS:"))
            .map(kb_to_mb);

        let snapshot = MemorySnapshot {
            total_mb: kb_to_mb(total_kb),
            available_mb: kb_to_mb(available_kb),
            process_rss_mb,
        };
        debug!(
            total_mb = snapshot.total_mb,
            available_mb = snapshot.available_mb,
            "memory snapshot"
        );
        Some(snapshot)
    }
}

#[allow(clippy::cast_precision_loss)]
fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// Parses a `Key:   12345 kB` line.
fn kb_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Fixed reading, for tests and `--assume-free-memory`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticMemoryProbe {
    snapshot: Option<MemorySnapshot>,
}

impl StaticMemoryProbe {
    /// A probe reporting `free_ratio` of a nominal 16 GiB machine.
    #[must_use]
    pub fn with_free_ratio(free_ratio: f64) -> Self {
        let total_mb = 16_384.0;
        Self {
            snapshot: Some(MemorySnapshot {
                total_mb,
                available_mb: total_mb * free_ratio.clamp(0.0, 1.0),
                process_rss_mb: None,
            }),
        }
    }

    /// A probe that never has data.
    #[must_use]
    pub fn unknown() -> Self {
        Self { snapshot: None }
    }
}

#[async_trait]
impl MemoryProbe for StaticMemoryProbe {
    async fn snapshot(&self) -> Option<MemorySnapshot> {
        self.snapshot
    }
}
