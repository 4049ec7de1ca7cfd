//! Single-URL download path.
//!
//! [`TransportSelector`] decides how a URL is fetched, [`DownloadExecutor`]
//! fetches it (rendered page or plain HTTP) and hands the bytes to an
//! [`ImageSink`]. All transfers share one [`BandwidthThrottle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use harvest_core::download::{BandwidthThrottle, DownloadExecutor, FileSink, HttpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = DownloadExecutor::new(
//!     Arc::new(HttpClient::new()?),
//!     Arc::new(BandwidthThrottle::new(512)),
//!     Arc::new(FileSink::create("./images").await?),
//!     Duration::from_secs(30),
//! );
//! # let _ = executor;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod content;
mod error;
mod executor;
pub mod filename;
mod locate;
mod sink;
mod throttle;
mod transport;

pub use client::{HttpClient, HttpResponse, LightweightTransport, RequestHeaders};
pub use content::{ContentPolicy, content_type, is_acceptable_content_type, is_html};
pub use error::{CriticalError, DownloadError, FailureClass, SaveError, classify_error};
pub use executor::{DownloadExecutor, DownloadResult, ExecutionFailure, RunContext};
pub use locate::{BestImageLocator, ImageLocator};
pub use sink::{FileSink, ImageSink, MemorySink};
pub use throttle::BandwidthThrottle;
pub use transport::{Transport, TransportSelector, select_transport};
