//! CLI entry point for the harvest tool.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harvest_core::download::FileSink;
use harvest_core::pool::{MemoryProbe, StaticMemoryProbe, SystemMemoryProbe};
use harvest_core::{Harvester, RunConfig, RunError};
use tracing::{debug, info};

mod cli;
mod progress;

use cli::Args;
use progress::SpinnerObserver;

/// Exit code when URLs failed permanently.
const EXIT_PARTIAL: u8 = 1;

/// Exit code when a critical error aborted the run.
const EXIT_ABORTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    args.apply_overrides(&mut config);

    let urls = read_urls(&args)?;
    if urls.is_empty() {
        info!("No input provided. Pipe image URLs via stdin or pass them as arguments.");
        info!("Example: echo 'https://example.com/a.jpg' | harvest --site https://example.com/");
        return Ok(ExitCode::SUCCESS);
    }
    let site = args.site.clone().unwrap_or_default();
    info!(urls = urls.len(), site = %site, "Harvest starting");

    let sink = FileSink::create(&args.output_dir)
        .await
        .with_context(|| format!("cannot create output directory {}", args.output_dir.display()))?;
    let probe: Arc<dyn MemoryProbe> = match args.assume_free_memory {
        Some(ratio) => Arc::new(StaticMemoryProbe::with_free_ratio(ratio)),
        None => Arc::new(SystemMemoryProbe),
    };
    let spinner = Arc::new(SpinnerObserver::new(
        !args.quiet && io::stderr().is_terminal(),
        urls.len(),
    ));

    let builder = Harvester::builder(config)
        .sink(Arc::new(sink))
        .memory_probe(probe)
        .observer(spinner.clone());

    #[cfg(feature = "browser")]
    let browser = if args.browser {
        use harvest_core::browser::{ChromiumOptions, ChromiumProvider};

        let provider = ChromiumProvider::launch(ChromiumOptions {
            context_url: args.site.clone(),
            ..ChromiumOptions::default()
        })
        .await
        .context("failed to start browser")?;
        Some(Arc::new(provider))
    } else {
        None
    };
    #[cfg(feature = "browser")]
    let builder = match &browser {
        Some(provider) => builder.provider(provider.clone()),
        None => builder,
    };

    let harvester = builder.build()?;
    let outcome = harvester.run(&site, &urls).await;
    drop(harvester);
    spinner.finish();

    #[cfg(feature = "browser")]
    if let Some(provider) = browser {
        match Arc::try_unwrap(provider) {
            Ok(provider) => provider.close().await,
            Err(_) => tracing::warn!("browser still shared at exit, leaving it to drop"),
        }
    }

    match outcome {
        Ok(report) => {
            println!("{}", report.summary());
            if report.is_complete() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_PARTIAL))
            }
        }
        Err(RunError::Aborted(e)) => {
            eprintln!("fatal: run aborted while saving {}: {}", e.url, e.reason);
            if let Some(path) = &e.path {
                eprintln!("  path: {}", path.display());
            }
            Ok(ExitCode::from(EXIT_ABORTED))
        }
        Err(e) => Err(e.into()),
    }
}

/// URLs from positional arguments, else one per line from piped stdin.
///
/// Blank lines and `#` comments are skipped.
fn read_urls(args: &Args) -> Result<Vec<String>> {
    let raw = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        return Ok(Vec::new());
    };

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
