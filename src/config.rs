//! Run configuration for download orchestration.
//!
//! Configuration arrives already shaped by the caller (CLI flags or a JSON
//! file). Keys use camelCase so that a config file reads like:
//!
//! ```json
//! {
//!   "maxConcurrentRequests": 5,
//!   "minIntervalMs": 1000,
//!   "maxIntervalMs": 3000,
//!   "downloadMethod": "auto",
//!   "pagePoolStrategy": "auto",
//!   "pagePool": { "pws": { "weights": { "images": 0.3, "dom": 0.25, "payload": 0.25, "heap": 0.2 } } },
//!   "network": { "bandwidthLimitKbps": 0 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default number of concurrent downloads per wave.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default number of additional retry rounds.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Tolerance used when checking that PWS weights sum to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`RunConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value outside its accepted range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Config key (camelCase, dotted for nested keys).
        field: &'static str,
        /// What is wrong with the value.
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// How the transport for each URL is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMethod {
    /// Per-URL decision from site exceptions and direct-download patterns.
    #[default]
    Auto,
    /// Always the lightweight HTTP transport.
    Lightweight,
    /// Always the browser-rendered transport (the executor still falls back).
    RenderedPriority,
}

/// Page pool strategy setting: a manual override or automatic selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategySetting {
    /// Choose from memory pressure and the load score.
    #[default]
    Auto,
    /// Force the `reuse` strategy.
    Reuse,
    /// Force the `progressive` strategy.
    Progressive,
}

/// Which scorer drives automatic strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    /// Weighted composite load score.
    #[default]
    Pws,
    /// Legacy heuristic on the number of rendered downloads in the first wave.
    Size,
}

/// Weights of the PWS load score components.
///
/// Weights are advisory: they should sum to 1.0 for the score to stay on a
/// 0-100 scale, but other sums are accepted and only logged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PwsWeights {
    /// Weight of the estimated image count.
    pub images: f64,
    /// Weight of the estimated DOM size.
    pub dom: f64,
    /// Weight of the estimated payload bytes.
    pub payload: f64,
    /// Weight of the estimated heap pressure.
    pub heap: f64,
}

impl Default for PwsWeights {
    fn default() -> Self {
        Self {
            images: 0.30,
            dom: 0.25,
            payload: 0.25,
            heap: 0.20,
        }
    }
}

impl PwsWeights {
    /// Sum of all weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.images + self.dom + self.payload + self.heap
    }

    /// Returns true when the weights sum to 1.0 within tolerance.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
    }
}

/// `pagePool.pws` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PwsConfig {
    /// Component weights.
    pub weights: PwsWeights,
}

/// Health limits applied to reused handles (`pagePool.reuse`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReuseConfig {
    /// A handle used more than this many times is recycled.
    pub max_reuse: u32,
    /// A handle whose JS heap exceeds this many MB is recycled.
    pub max_heap_mb: f64,
    /// A handle with this many consecutive 5xx responses is recycled.
    pub max_consecutive_errors: u32,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            max_reuse: 20,
            max_heap_mb: 200.0,
            max_consecutive_errors: 3,
        }
    }
}

/// `pagePool.progressive` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressiveConfig {
    /// Prepare the next wave's handles while the current wave downloads.
    pub preload: bool,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self { preload: true }
    }
}

/// `pagePool` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PagePoolConfig {
    /// Load score settings.
    pub pws: PwsConfig,
    /// Scores below this threshold choose `reuse`.
    pub auto_threshold: f64,
    /// Free-memory ratio below which `progressive` is forced.
    pub memory_threshold: f64,
    /// Scorer used in automatic mode.
    pub scoring: ScoringMode,
    /// Rendered-download count at or below which the size heuristic picks `reuse`.
    pub size_threshold: usize,
    /// Handle health limits.
    pub reuse: ReuseConfig,
    /// Progressive strategy settings.
    pub progressive: ProgressiveConfig,
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self {
            pws: PwsConfig::default(),
            auto_threshold: 50.0,
            memory_threshold: 0.25,
            scoring: ScoringMode::default(),
            size_threshold: 10,
            reuse: ReuseConfig::default(),
            progressive: ProgressiveConfig::default(),
        }
    }
}

/// `network` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Aggregate download throughput cap in KiB/s; 0 disables throttling.
    pub bandwidth_limit_kbps: u64,
    /// Per-request timeout for both transports.
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bandwidth_limit_kbps: 0,
            timeout_ms: 30_000,
        }
    }
}

/// A site known to serve images without rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteException {
    /// Host (or parent domain) of the site page being crawled.
    pub host: String,
    /// Only applies when thumbnail-to-original mode is enabled.
    #[serde(default)]
    pub when_original_mode: bool,
}

/// Complete configuration for one download run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    /// Wave size (number of concurrent downloads).
    pub max_concurrent_requests: usize,
    /// Lower bound of the randomized inter-wave delay.
    pub min_interval_ms: u64,
    /// Upper bound of the randomized inter-wave delay.
    pub max_interval_ms: u64,
    /// Additional retry rounds after the first pass.
    pub max_retries: u32,
    /// Wait between retry rounds.
    pub retry_delay_seconds: u64,
    /// Transport selection mode.
    pub download_method: DownloadMethod,
    /// Page pool strategy override.
    pub page_pool_strategy: StrategySetting,
    /// Page pool tuning.
    pub page_pool: PagePoolConfig,
    /// Network limits.
    pub network: NetworkConfig,
    /// Regexes for direct-download/CDN URLs served over the lightweight transport.
    pub direct_download_patterns: Vec<String>,
    /// Per-site transport exceptions.
    pub site_exceptions: Vec<SiteException>,
    /// Whether thumbnails are being rewritten to their original images.
    pub thumbnail_to_original: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_CONCURRENCY,
            min_interval_ms: 1000,
            max_interval_ms: 3000,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: 5,
            download_method: DownloadMethod::default(),
            page_pool_strategy: StrategySetting::default(),
            page_pool: PagePoolConfig::default(),
            network: NetworkConfig::default(),
            direct_download_patterns: Vec::new(),
            site_exceptions: Vec::new(),
            thumbnail_to_original: false,
        }
    }
}

impl RunConfig {
    /// Loads a config from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "loaded run config");
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// Non-normalized PWS weights are accepted with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent_requests) {
            return Err(ConfigError::invalid(
                "maxConcurrentRequests",
                format!(
                    "{} (expected {MIN_CONCURRENCY}..={MAX_CONCURRENCY})",
                    self.max_concurrent_requests
                ),
            ));
        }

        if self.min_interval_ms > self.max_interval_ms {
            return Err(ConfigError::invalid(
                "minIntervalMs",
                format!(
                    "{} is greater than maxIntervalMs {}",
                    self.min_interval_ms, self.max_interval_ms
                ),
            ));
        }

        let pool = &self.page_pool;
        if !pool.auto_threshold.is_finite() || pool.auto_threshold < 0.0 {
            return Err(ConfigError::invalid(
                "pagePool.autoThreshold",
                format!("{} (expected a non-negative number)", pool.auto_threshold),
            ));
        }
        if !(0.0..=1.0).contains(&pool.memory_threshold) {
            return Err(ConfigError::invalid(
                "pagePool.memoryThreshold",
                format!("{} (expected 0.0..=1.0)", pool.memory_threshold),
            ));
        }
        if !pool.reuse.max_heap_mb.is_finite() || pool.reuse.max_heap_mb <= 0.0 {
            return Err(ConfigError::invalid(
                "pagePool.reuse.maxHeapMb",
                format!("{} (expected a positive number)", pool.reuse.max_heap_mb),
            ));
        }

        let weights = pool.pws.weights;
        let all_weights = [weights.images, weights.dom, weights.payload, weights.heap];
        if all_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid(
                "pagePool.pws.weights",
                "weights must be non-negative numbers",
            ));
        }
        if !weights.is_normalized() {
            warn!(
                sum = weights.sum(),
                "PWS weights do not sum to 1.0; scores are advisory and may exceed 0-100"
            );
        }

        for pattern in &self.direct_download_patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(ConfigError::invalid(
                    "directDownloadPatterns",
                    format!("{pattern}: {e}"),
                ));
            }
        }

        Ok(())
    }

    /// Total number of rounds (first pass plus retries).
    #[must_use]
    pub fn max_rounds(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.timeout_ms)
    }

    /// Wait between retry rounds.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}
