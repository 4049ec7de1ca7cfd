//! PWS load score.
//!
//! The score estimates how heavy the first wave of downloads will be for the
//! browser. Four components are estimated from the URLs alone, normalized to
//! `0.0..=1.0` against fixed caps, weighted, and scaled to `0..=100`:
//!
//! | Component | Estimate | Cap |
//! |-----------|----------|-----|
//! | images | number of URLs in the wave | 50 |
//! | dom | DOM nodes per rendered page | 5 000 |
//! | payload | sum of expected image bytes | 50 MB |
//! | heap | JS heap of all rendered pages | 1 024 MB |
//!
//! Weights are advisory. With weights that do not sum to 1.0 the score may
//! leave the `0..=100` range, which only shifts the threshold comparison.

use url::Url;

use crate::config::PwsWeights;
use crate::download::Transport;

const IMAGE_COUNT_CAP: f64 = 50.0;
const DOM_NODES_CAP: f64 = 5_000.0;
const PAYLOAD_BYTES_CAP: f64 = 50.0 * 1024.0 * 1024.0;
const HEAP_MB_CAP: f64 = 1_024.0;

/// DOM nodes of a typical image wrapper page.
const DOM_NODES_PER_PAGE: f64 = 1_500.0;
/// JS heap of one rendered page.
const HEAP_MB_PER_PAGE: f64 = 60.0;

/// Raw load estimate for one wave.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadEstimate {
    /// Images to download.
    pub image_count: usize,
    /// DOM nodes per rendered page.
    pub dom_nodes: f64,
    /// Expected payload bytes.
    pub payload_bytes: f64,
    /// Expected JS heap of all rendered pages in MB.
    pub heap_mb: f64,
}

impl LoadEstimate {
    /// Estimates the load of `urls`, each paired with its transport.
    #[must_use]
    pub fn from_wave<'a>(wave: impl IntoIterator<Item = (&'a str, Transport)>) -> Self {
        let mut estimate = Self::default();
        let mut rendered = 0_u32;
        for (url, transport) in wave {
            estimate.image_count += 1;
            estimate.payload_bytes += expected_image_bytes(url);
            if transport == Transport::Rendered {
                rendered += 1;
            }
        }
        if rendered > 0 {
            estimate.dom_nodes = DOM_NODES_PER_PAGE;
            estimate.heap_mb = f64::from(rendered) * HEAP_MB_PER_PAGE;
        }
        estimate
    }

    /// Components normalized to `0.0..=1.0`, in weight order.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn normalized(&self) -> [f64; 4] {
        [
            (self.image_count as f64 / IMAGE_COUNT_CAP).min(1.0),
            (self.dom_nodes / DOM_NODES_CAP).clamp(0.0, 1.0),
            (self.payload_bytes / PAYLOAD_BYTES_CAP).clamp(0.0, 1.0),
            (self.heap_mb / HEAP_MB_CAP).clamp(0.0, 1.0),
        ]
    }
}

/// Weighted composite score of `estimate`.
#[must_use]
pub fn pws_score(estimate: &LoadEstimate, weights: &PwsWeights) -> f64 {
    let [images, dom, payload, heap] = estimate.normalized();
    100.0
        * (weights.images * images
            + weights.dom * dom
            + weights.payload * payload
            + weights.heap * heap)
}

/// Expected image size from the URL's extension and size hints.
fn expected_image_bytes(url: &str) -> f64 {
    const KIB: f64 = 1024.0;

    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());

    let base = if path.ends_with(".gif") {
        2_048.0 * KIB
    } else if path.ends_with(".png") || path.ends_with(".bmp") || path.ends_with(".tif") {
        1_024.0 * KIB
    } else if path.ends_with(".webp") || path.ends_with(".avif") {
        300.0 * KIB
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        500.0 * KIB
    } else {
        800.0 * KIB
    };

    if ["original", "full", "large", "/orig/"]
        .iter()
        .any(|hint| path.contains(hint))
    {
        base * 2.0
    } else if ["thumb", "small", "preview"].iter().any(|hint| path.contains(hint)) {
        base / 4.0
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(urls: &[&'static str]) -> LoadEstimate {
        LoadEstimate::from_wave(urls.iter().map(|u| (*u, Transport::Rendered)))
    }

    #[test]
    fn test_empty_wave_scores_zero() {
        let score = pws_score(&LoadEstimate::default(), &PwsWeights::default());
        assert!(score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_saturated_components_score_hundred() {
        let estimate = LoadEstimate {
            image_count: 500,
            dom_nodes: 1e6,
            payload_bytes: 1e12,
            heap_mb: 1e6,
        };
        let score = pws_score(&estimate, &PwsWeights::default());
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_wave_scores_below_default_threshold() {
        let estimate = rendered(&[
            "https://a.example/1.jpg",
            "https://a.example/2.jpg",
            "https://a.example/3.jpg",
        ]);
        assert!(pws_score(&estimate, &PwsWeights::default()) < 50.0);
    }

    #[test]
    fn test_lightweight_urls_add_no_browser_load() {
        let estimate = LoadEstimate::from_wave([("https://a.example/1.jpg", Transport::Lightweight)]);
        assert_eq!(estimate.image_count, 1);
        assert!(estimate.dom_nodes.abs() < f64::EPSILON);
        assert!(estimate.heap_mb.abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_is_linear_in_weights() {
        let estimate = rendered(&["https://a.example/full/1.png"; 10]);
        let single = PwsWeights {
            images: 1.0,
            dom: 0.0,
            payload: 0.0,
            heap: 0.0,
        };
        // 10 of 50 images
        assert!((pws_score(&estimate, &single) - 20.0).abs() < 1e-9);

        let doubled = PwsWeights {
            images: 2.0,
            ..single
        };
        assert!((pws_score(&estimate, &doubled) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_size_hints_scale_payload() {
        let full = expected_image_bytes("https://a.example/full/x.jpg");
        let plain = expected_image_bytes("https://a.example/x.jpg");
        let thumb = expected_image_bytes("https://a.example/thumbs/x.jpg");
        assert!(full > plain && plain > thumb);
    }
}
