//! Image filename derivation and collision-free path resolution.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Longest stem kept from a URL segment.
const MAX_STEM_CHARS: usize = 120;

/// Extensions recognised as image files.
const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif", ".bmp", ".svg", ".tif", ".tiff", ".ico",
    ".heic",
];

/// Derives a filename for an image downloaded from `url`.
///
/// The last path segment is URL-decoded and sanitized. When it has no image
/// extension, one is appended from `content_type` (or `.bin` when unknown).
#[must_use]
pub fn image_filename(url: &str, content_type: Option<&str>) -> String {
    let segment = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|last| !last.is_empty())
    });

    let decoded = segment.map(|raw| {
        urlencoding::decode(&raw)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or(raw)
    });

    let name = decoded
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.trim_matches('_').is_empty())
        .unwrap_or_else(|| "image".to_string());

    if has_image_extension(&name) {
        return truncate_stem(&name);
    }

    let extension = content_type.map_or(".bin", extension_from_content_type);
    format!("{}{extension}", truncate_stem(&name))
}

fn has_image_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn truncate_stem(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    if stem.chars().count() <= MAX_STEM_CHARS {
        return name.to_string();
    }
    let short: String = stem.chars().take(MAX_STEM_CHARS).collect();
    format!("{short}{ext}")
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Guesses an image file extension from a Content-Type header value.
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "image/bmp" => ".bmp",
        "image/svg+xml" => ".svg",
        "image/tiff" => ".tif",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "image/heic" => ".heic",
        _ => ".bin",
    }
}

/// Replaces characters that are invalid on common filesystems.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Returns `dir/filename`, or `dir/stem_N.ext` for the first free `N >= 1`.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = sanitize_filename(filename);
    let base_path = dir.join(&filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = split_extension(&filename);
    (1..10_000)
        .map(|i| dir.join(format!("{stem}_{i}{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            dir.join(format!("{stem}_{nanos}{ext}"))
        })
}
