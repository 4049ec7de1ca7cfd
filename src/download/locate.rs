//! Embedded image lookup for HTML wrapper pages.
//!
//! When the rendered transport lands on an HTML page instead of an image, the
//! executor asks an [`ImageLocator`] for the single best image URL on that page.

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

/// Finds the best embedded image URL in an HTML document.
pub trait ImageLocator: Send + Sync {
    /// Returns an absolute image URL found in `html`, resolved against `page_url`.
    fn locate(&self, html: &str, page_url: &str) -> Option<String>;
}

/// Default locator.
///
/// Candidates, first hit wins:
/// 1. `og:image` / `og:image:url` meta
/// 2. `twitter:image` meta
/// 3. `<link rel="image_src">`
/// 4. the `<img>` with the largest declared `width * height`
/// 5. the first `<img>` with `src`, `data-src` or `data-original`
#[derive(Debug, Clone, Copy, Default)]
pub struct BestImageLocator;

const IMG_SOURCE_ATTRS: &[&str] = &["src", "data-src", "data-original"];

impl ImageLocator for BestImageLocator {
    fn locate(&self, html: &str, page_url: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();

        let candidate = meta_content(&document, "meta[property='og:image']")
            .or_else(|| meta_content(&document, "meta[property='og:image:url']"))
            .or_else(|| meta_content(&document, "meta[name='twitter:image']"))
            .or_else(|| meta_content(&document, "meta[property='twitter:image']"))
            .or_else(|| link_image_src(&document))
            .or_else(|| largest_img(&document))
            .or_else(|| first_img(&document))?;

        let resolved = resolve(base.as_ref(), &candidate)?;
        debug!(page = %page_url, image = %resolved, "located embedded image");
        Some(resolved)
    }
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn link_image_src(document: &Html) -> Option<String> {
    let selector = Selector::parse("link[rel='image_src']").ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn img_source(element: &ElementRef<'_>) -> Option<String> {
    IMG_SOURCE_ATTRS
        .iter()
        .filter_map(|attr| element.value().attr(attr))
        .map(str::trim)
        .find(|s| !s.is_empty() && !s.starts_with("data:"))
        .map(str::to_string)
}

fn dimension(element: &ElementRef<'_>, attr: &str) -> Option<u64> {
    element
        .value()
        .attr(attr)
        .map(|raw| raw.trim().trim_end_matches("px"))
        .and_then(|raw| raw.parse::<u64>().ok())
}

fn largest_img(document: &Html) -> Option<String> {
    let selector = Selector::parse("img").ok()?;
    document
        .select(&selector)
        .filter_map(|el| {
            let area = dimension(&el, "width")?.saturating_mul(dimension(&el, "height")?);
            Some((area, img_source(&el)?))
        })
        .filter(|(area, _)| *area > 0)
        // ties go to the earliest image in document order
        .fold(None, |best: Option<(u64, String)>, (area, src)| match best {
            Some((best_area, _)) if best_area >= area => best,
            _ => Some((area, src)),
        })
        .map(|(_, src)| src)
}

fn first_img(document: &Html) -> Option<String> {
    let selector = Selector::parse("img").ok()?;
    document.select(&selector).find_map(|el| img_source(&el))
}

fn resolve(base: Option<&Url>, candidate: &str) -> Option<String> {
    match Url::parse(candidate) {
        Ok(url) => Some(url.to_string()),
        Err(_) => base?.join(candidate).ok().map(|url| url.to_string()),
    }
}
