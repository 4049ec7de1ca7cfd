//! Error types for the download module.
//!
//! Every concrete failure maps onto one of three classes (see
//! [`classify_error`]): transient failures and unacceptable content are
//! retried at batch and round level, critical failures abort the whole run.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while downloading one URL.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or navigation timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The rendered context failed to load the URL.
    #[error("navigation failed for {url}: {message}")]
    Navigation {
        /// The URL being navigated to.
        url: String,
        /// Provider-reported reason.
        message: String,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The response is not image content.
    #[error("not an image: {url} returned content-type {content_type}")]
    NotAnImage {
        /// The URL that was fetched.
        url: String,
        /// The offending content type (empty when missing).
        content_type: String,
    },

    /// An HTML wrapper page did not reference any image.
    #[error("no embedded image found in HTML page {url}")]
    NoEmbeddedImage {
        /// The HTML page URL.
        url: String,
    },

    /// HTML wrapper pages nested deeper than the resolution limit.
    #[error("HTML resolution for {url} exceeded {depth} levels")]
    RecursionExceeded {
        /// The original URL.
        url: String,
        /// The recursion limit that was hit.
        depth: usize,
    },

    /// No resource handle could be obtained.
    #[error("no page handle available for {url}: {message}")]
    PoolExhausted {
        /// The URL waiting for a handle.
        url: String,
        /// Provider-reported reason.
        message: String,
    },

    /// Persisting the buffer failed without endangering run consistency.
    #[error("failed to save {url}: {message}")]
    Save {
        /// The downloaded URL.
        url: String,
        /// Persistence-reported reason.
        message: String,
    },

    /// Persisting the buffer failed in a way that must abort the run.
    #[error(transparent)]
    Critical(#[from] CriticalError),
}

/// Failure that aborts the entire run.
///
/// Raised only by the persistence collaborator; never retried because a
/// retry could leave persisted state inconsistent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("critical failure saving {url}: {reason}")]
pub struct CriticalError {
    /// URL whose result could not be persisted.
    pub url: String,
    /// File-system (or other persistence) reason.
    pub reason: String,
    /// Path involved, when known.
    pub path: Option<PathBuf>,
}

impl CriticalError {
    /// Creates a critical error.
    pub fn new(url: impl Into<String>, reason: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
            path,
        }
    }
}

/// Error reported by the persistence collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SaveError {
    /// Human-readable reason.
    pub message: String,
    /// Path involved, when known.
    pub path: Option<PathBuf>,
    /// Whether the failure must abort the run.
    pub critical: bool,
}

impl SaveError {
    /// An ordinary save failure, retried like a transient error.
    pub fn ordinary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            critical: false,
        }
    }

    /// A critical save failure.
    pub fn critical(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            message: message.into(),
            path,
            critical: true,
        }
    }

    /// Converts into the executor-level error for `url`.
    #[must_use]
    pub fn into_download_error(self, url: &str) -> DownloadError {
        if self.critical {
            DownloadError::Critical(CriticalError::new(url, self.message, self.path))
        } else {
            DownloadError::Save {
                url: url.to_string(),
                message: self.message,
            }
        }
    }
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a navigation error.
    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a not-an-image error.
    pub fn not_an_image(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::NotAnImage {
            url: url.into(),
            content_type: content_type.into(),
        }
    }

    /// Returns true for errors that must abort the run.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }

    /// Returns true for HTTP 5xx responses.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if (500..600).contains(status))
    }
}

/// Classification of download failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network, timeout, navigation or pool failure.
    Transient,
    /// Wrong content type, HTML without image, recursion exceeded.
    Unacceptable,
    /// Persistence failure that aborts the run.
    Critical,
}

impl FailureClass {
    /// Returns true if a later round may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Critical)
    }
}

/// Classifies a download error.
///
/// | Error | Class |
/// |-------|-------|
/// | Network, Timeout, HttpStatus, Navigation, InvalidUrl | Transient |
/// | PoolExhausted, Save | Transient |
/// | NotAnImage, NoEmbeddedImage, RecursionExceeded | Unacceptable |
/// | Critical | Critical |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureClass {
    match error {
        DownloadError::Network { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::HttpStatus { .. }
        | DownloadError::Navigation { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::PoolExhausted { .. }
        | DownloadError::Save { .. } => FailureClass::Transient,

        DownloadError::NotAnImage { .. }
        | DownloadError::NoEmbeddedImage { .. }
        | DownloadError::RecursionExceeded { .. } => FailureClass::Unacceptable,

        DownloadError::Critical(_) => FailureClass::Critical,
    }
}
