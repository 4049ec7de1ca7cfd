//! Harvest Core Library
//!
//! Concurrent image download orchestration: given the image URLs found on a
//! site, decide per URL whether to fetch it through a browser-rendered page or
//! a plain HTTP request, run the downloads in throttled waves over a pool of
//! browser pages, and retry failures for a bounded number of rounds.
//!
//! # Architecture
//!
//! - [`config`] - Run configuration (JSON, camelCase keys) and validation
//! - [`download`] - Transport selection, bandwidth throttle, single-URL executor
//! - [`pool`] - Page handles, health checks, strategy selection, preloading
//! - [`batch`] - Wave coordinator and retry rounds
//! - [`task`] - Per-URL task ledger
//! - [`observer`] - Progress callbacks
//! - [`run`] - [`Harvester`], which composes a complete run
//!
//! With the `browser` feature, `browser::ChromiumProvider` drives headless
//! Chromium for the rendered transport.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod download;
pub mod observer;
pub mod pool;
pub mod run;
pub mod task;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use batch::{BatchCoordinator, BatchResult, RetryController, RetryReport, run_batches};
pub use config::{ConfigError, DownloadMethod, RunConfig, StrategySetting};
pub use download::{
    BandwidthThrottle, CriticalError, DownloadError, DownloadExecutor, FileSink, HttpClient,
    Transport, TransportSelector, select_transport,
};
pub use observer::{NoopObserver, ProgressObserver, TracingObserver};
pub use pool::{PagePoolScheduler, PoolMetrics, PoolStrategy, ProgressivePreloader};
pub use run::{Harvester, HarvesterBuilder, RunError, RunReport};
pub use task::{DownloadTask, TaskLedger, TaskStatus};
