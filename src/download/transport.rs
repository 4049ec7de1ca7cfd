//! Per-URL transport selection.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! 1. `downloadMethod = "lightweight"` → lightweight
//! 2. `downloadMethod = "rendered-priority"` → rendered
//! 3. `auto`: site exceptions and direct-download patterns → lightweight,
//!    everything else → rendered
//!
//! Selection is a pure function of its inputs.

use std::fmt;

use regex::Regex;
use tracing::warn;
use url::Url;

use crate::config::{DownloadMethod, RunConfig, SiteException};

/// Transport used for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Direct HTTP request.
    Lightweight,
    /// Browser-rendered context.
    Rendered,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lightweight => f.write_str("lightweight"),
            Self::Rendered => f.write_str("rendered"),
        }
    }
}

/// Compiled transport selection rules.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    method: DownloadMethod,
    direct_patterns: Vec<Regex>,
    site_exceptions: Vec<SiteException>,
    original_mode: bool,
}

impl TransportSelector {
    /// Compiles selection rules from config.
    ///
    /// Patterns that fail to compile are skipped with a warning; run
    /// [`RunConfig::validate`] first to reject them up front.
    #[must_use]
    pub fn new(config: &RunConfig) -> Self {
        let direct_patterns = config
            .direct_download_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "skipping invalid direct-download pattern");
                    None
                }
            })
            .collect();

        Self {
            method: config.download_method,
            direct_patterns,
            site_exceptions: config.site_exceptions.clone(),
            original_mode: config.thumbnail_to_original,
        }
    }

    /// Returns the transport that should serve `url`, found on `current_page_url`.
    #[must_use]
    pub fn select(&self, url: &str, current_page_url: &str) -> Transport {
        match self.method {
            DownloadMethod::Lightweight => Transport::Lightweight,
            DownloadMethod::RenderedPriority => Transport::Rendered,
            DownloadMethod::Auto => {
                if self.matches_site_exception(current_page_url)
                    || self.matches_direct_pattern(url)
                {
                    Transport::Lightweight
                } else {
                    Transport::Rendered
                }
            }
        }
    }

    fn matches_site_exception(&self, page_url: &str) -> bool {
        let Some(host) = host_of(page_url) else {
            return false;
        };
        self.site_exceptions.iter().any(|exception| {
            (!exception.when_original_mode || self.original_mode)
                && host_matches(&host, &exception.host)
        })
    }

    fn matches_direct_pattern(&self, url: &str) -> bool {
        self.direct_patterns.iter().any(|re| re.is_match(url))
    }
}

/// One-shot selection without keeping the compiled rules around.
#[must_use]
pub fn select_transport(url: &str, current_page_url: &str, config: &RunConfig) -> Transport {
    TransportSelector::new(config).select(url, current_page_url)
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// `host` equals `rule` or is a subdomain of it.
fn host_matches(host: &str, rule: &str) -> bool {
    let rule = rule.trim().trim_start_matches('.').to_lowercase();
    if rule.is_empty() {
        return false;
    }
    host == rule || host.ends_with(&format!(".{rule}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://gallery.example.com/album/1";
    const IMG: &str = "https://img.example.com/photo.jpg";

    fn config_with(method: DownloadMethod) -> RunConfig {
        RunConfig {
            download_method: method,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_lightweight_method_always_lightweight() {
        let mut config = config_with(DownloadMethod::Lightweight);
        config.direct_download_patterns = vec![r"never-matches".into()];
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Lightweight);
    }

    #[test]
    fn test_rendered_priority_ignores_patterns() {
        let mut config = config_with(DownloadMethod::RenderedPriority);
        config.direct_download_patterns = vec![r"img\.example\.com".into()];
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Rendered);
    }

    #[test]
    fn test_auto_defaults_to_rendered() {
        let config = config_with(DownloadMethod::Auto);
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Rendered);
    }

    #[test]
    fn test_auto_direct_pattern_routes_lightweight() {
        let mut config = config_with(DownloadMethod::Auto);
        config.direct_download_patterns = vec![r"^https://img\.example\.com/".into()];
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Lightweight);
        assert_eq!(
            select_transport("https://other.net/x.jpg", PAGE, &config),
            Transport::Rendered
        );
    }

    #[test]
    fn test_auto_site_exception_matches_subdomain() {
        let mut config = config_with(DownloadMethod::Auto);
        config.site_exceptions = vec![SiteException {
            host: "example.com".into(),
            when_original_mode: false,
        }];
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Lightweight);
        assert_eq!(
            select_transport(IMG, "https://notexample.com/", &config),
            Transport::Rendered
        );
    }

    #[test]
    fn test_site_exception_gated_on_original_mode() {
        let mut config = config_with(DownloadMethod::Auto);
        config.site_exceptions = vec![SiteException {
            host: "gallery.example.com".into(),
            when_original_mode: true,
        }];
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Rendered);

        config.thumbnail_to_original = true;
        assert_eq!(select_transport(IMG, PAGE, &config), Transport::Lightweight);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let mut config = config_with(DownloadMethod::Auto);
        config.direct_download_patterns = vec![r"\.png$".into()];
        let selector = TransportSelector::new(&config);
        for url in [IMG, "https://cdn.example.com/a.png", "not a url"] {
            let first = selector.select(url, PAGE);
            for _ in 0..5 {
                assert_eq!(selector.select(url, PAGE), first);
                assert_eq!(select_transport(url, PAGE, &config), first);
            }
        }
    }

    #[test]
    fn test_unparseable_page_url_skips_exceptions() {
        let mut config = config_with(DownloadMethod::Auto);
        config.site_exceptions = vec![SiteException {
            host: "example.com".into(),
            when_original_mode: false,
        }];
        assert_eq!(select_transport(IMG, "local.html", &config), Transport::Rendered);
    }
}
