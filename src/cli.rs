//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use harvest_core::config::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use harvest_core::{DownloadMethod, RunConfig, StrategySetting};

/// Download the images of a site page.
///
/// Image URLs are read from the arguments or, one per line, from stdin.
/// Each URL is fetched through a browser-rendered page or a plain HTTP
/// request, in throttled waves, with failed URLs retried in later rounds.
#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(author, version, about)]
pub struct Args {
    /// Image URLs to download (reads stdin when omitted)
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// Page the image URLs were found on (sent as Referer)
    #[arg(short, long, value_name = "URL")]
    pub site: Option<String>,

    /// Directory downloaded images are written to
    #[arg(short, long, default_value = "./images")]
    pub output_dir: PathBuf,

    /// JSON run configuration; flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Downloads per wave (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Retry rounds after the first pass (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Transport selection mode
    #[arg(long, value_enum)]
    pub method: Option<MethodArg>,

    /// Page pool strategy
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Aggregate bandwidth cap in KiB/s (0 for unlimited)
    #[arg(long, value_name = "KBPS")]
    pub bandwidth_kbps: Option<u64>,

    /// Use this free-memory ratio (0.0-1.0) instead of reading system memory
    #[arg(long, value_name = "RATIO", value_parser = parse_ratio)]
    pub assume_free_memory: Option<f64>,

    /// Launch headless Chromium for rendered downloads
    #[cfg(feature = "browser")]
    #[arg(long)]
    pub browser: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// `--method` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    /// Decide per URL
    Auto,
    /// Plain HTTP only
    Lightweight,
    /// Browser first, HTTP fallback
    RenderedPriority,
}

impl From<MethodArg> for DownloadMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Auto => Self::Auto,
            MethodArg::Lightweight => Self::Lightweight,
            MethodArg::RenderedPriority => Self::RenderedPriority,
        }
    }
}

/// `--strategy` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Choose from memory pressure and load score
    Auto,
    /// One pool for the whole run
    Reuse,
    /// A fresh pool per wave
    Progressive,
}

impl From<StrategyArg> for StrategySetting {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Auto => Self::Auto,
            StrategyArg::Reuse => Self::Reuse,
            StrategyArg::Progressive => Self::Progressive,
        }
    }
}

impl Args {
    /// Applies flag overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut RunConfig) {
        if let Some(c) = self.concurrency {
            config.max_concurrent_requests = usize::from(c).clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        }
        if let Some(r) = self.max_retries {
            config.max_retries = u32::from(r);
        }
        if let Some(method) = self.method {
            config.download_method = method.into();
        }
        if let Some(strategy) = self.strategy {
            config.page_pool_strategy = strategy.into();
        }
        if let Some(kbps) = self.bandwidth_kbps {
            config.network.bandwidth_limit_kbps = kbps;
        }
    }
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{ratio} is outside 0.0-1.0"))
    }
}
