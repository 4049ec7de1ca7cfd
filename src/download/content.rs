//! Binary content policy.
//!
//! Decides from response headers whether a payload is an acceptable image.
//! The executor consults it after HTML resolution on the rendered path.

use reqwest::header::{CONTENT_TYPE, HeaderMap};

/// Which content types count as downloadable images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPolicy {
    /// Accept `application/octet-stream` and `binary/octet-stream`.
    pub allow_octet_stream: bool,
    /// Accept responses without a Content-Type header.
    pub allow_missing: bool,
    /// `image/*` subtypes that are rejected even though they are images.
    pub denied_image_types: Vec<String>,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            allow_octet_stream: true,
            allow_missing: false,
            denied_image_types: Vec::new(),
        }
    }
}

impl ContentPolicy {
    /// Only `image/*` content.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            allow_octet_stream: false,
            allow_missing: false,
            denied_image_types: Vec::new(),
        }
    }

    /// Returns whether `headers` describe acceptable content.
    #[must_use]
    pub fn accepts(&self, headers: &HeaderMap) -> bool {
        let Some(mime) = content_type(headers) else {
            return self.allow_missing;
        };

        if let Some(subtype) = mime.strip_prefix("image/") {
            return !self
                .denied_image_types
                .iter()
                .any(|denied| denied.eq_ignore_ascii_case(subtype));
        }

        self.allow_octet_stream
            && matches!(
                mime.as_str(),
                "application/octet-stream" | "binary/octet-stream"
            )
    }
}

/// Returns whether `headers` describe acceptable content under `policy`.
#[must_use]
pub fn is_acceptable_content_type(headers: &HeaderMap, policy: &ContentPolicy) -> bool {
    policy.accepts(headers)
}

/// Lower-cased MIME type without parameters, when present and non-empty.
#[must_use]
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty())
}

/// Returns true for `text/html` and XHTML responses.
#[must_use]
pub fn is_html(headers: &HeaderMap) -> bool {
    content_type(headers)
        .is_some_and(|mime| mime == "text/html" || mime == "application/xhtml+xml")
}
