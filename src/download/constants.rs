//! Constants for the download module (timeouts, headers, resolution limits).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of HTML wrapper pages followed for one URL.
///
/// The first response counts as level 0; a fourth HTML page fails with
/// `RecursionExceeded`.
pub const MAX_HTML_RECURSION: usize = 3;

/// Fixed User-Agent sent by both transports.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Accept header for image requests.
pub const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";
