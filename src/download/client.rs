//! Lightweight HTTP transport.
//!
//! [`LightweightTransport`] is the seam the executor downloads through when no
//! rendering is needed. [`HttpClient`] implements it on top of reqwest and
//! returns the body as a stream so the executor can charge every chunk to the
//! shared bandwidth throttle.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, REFERER, USER_AGENT};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT, IMAGE_ACCEPT};
use super::error::DownloadError;

/// Fixed identifying headers sent with every download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    /// User-Agent header value.
    pub user_agent: String,
    /// Accept header value.
    pub accept: String,
    /// Referer header value (the crawled site), if any.
    pub referer: Option<String>,
}

impl Default for RequestHeaders {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: IMAGE_ACCEPT.to_string(),
            referer: None,
        }
    }
}

impl RequestHeaders {
    /// Default headers with the site URL as Referer; non-HTTP site URLs
    /// send no Referer.
    #[must_use]
    pub fn for_site(site_url: &str) -> Self {
        Self {
            referer: site_url
                .starts_with("http")
                .then(|| site_url.to_string()),
            ..Self::default()
        }
    }
}

/// Response head plus a streaming body.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body chunks; errors are already mapped to [`DownloadError`].
    pub body: BoxStream<'static, Result<Bytes, DownloadError>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("final_url", &self.final_url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Direct HTTP GET used by the lightweight transport.
#[async_trait]
pub trait LightweightTransport: Send + Sync {
    /// Issues a GET for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures, timeouts
    /// and non-success status codes.
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
        timeout: Duration,
    ) -> Result<HttpResponse, DownloadError>;
}

/// reqwest-backed [`LightweightTransport`].
///
/// Create once and share; the inner client pools connections.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use harvest_core::download::{HttpClient, LightweightTransport, RequestHeaders};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let response = client
///     .get(
///         "https://example.com/photo.jpg",
///         &RequestHeaders::for_site("https://example.com/"),
///         Duration::from_secs(30),
///     )
///     .await?;
/// println!("status {}", response.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot initialize.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
    }

    /// Creates a client with an explicit connect timeout.
    ///
    /// The total request timeout is passed per call to [`LightweightTransport::get`].
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot initialize.
    #[instrument(level = "debug")]
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl LightweightTransport for HttpClient {
    #[instrument(skip(self, headers), fields(url = %url))]
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
        timeout: Duration,
    ) -> Result<HttpResponse, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut request = self
            .client
            .get(url)
            .timeout(timeout)
            .header(USER_AGENT, &headers.user_agent)
            .header(ACCEPT, &headers.accept);
        if let Some(referer) = &headers.referer {
            request = request.header(REFERER, referer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        debug!(status = status.as_u16(), final_url = %final_url, "response received");

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(&owned_url, e)))
            .boxed();

        Ok(HttpResponse {
            status: status.as_u16(),
            final_url,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}
