//! Persistence of downloaded image buffers.
//!
//! The executor hands every successful buffer to an [`ImageSink`]. A sink
//! reports ordinary failures (retried with the URL) separately from critical
//! ones, which abort the whole run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::content::content_type;
use super::error::SaveError;
use super::filename::{image_filename, resolve_unique_path};

/// Attempts at claiming a unique path before giving up.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Destination for downloaded buffers.
#[async_trait]
pub trait ImageSink: Send + Sync {
    /// Persists `buffer` downloaded from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SaveError`]; `critical` errors abort the run.
    async fn save(&self, buffer: &[u8], url: &str, headers: &HeaderMap) -> Result<(), SaveError>;
}

/// Writes each image to its own file in an output directory.
///
/// Filenames come from the URL path, collisions get a numeric suffix. Any
/// file-system error is critical since a retry could leave a partial file.
#[derive(Debug)]
pub struct FileSink {
    output_dir: PathBuf,
    saved: AtomicU64,
    bytes_written: AtomicU64,
}

impl FileSink {
    /// Creates the sink, creating `output_dir` when missing.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the directory cannot be created.
    pub async fn create(output_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        tokio::fs::create_dir_all(&output_dir).await?;
        debug!(dir = %output_dir.display(), "file sink ready");
        Ok(Self {
            output_dir,
            saved: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Number of files written.
    #[must_use]
    pub fn saved_count(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    /// Total bytes written.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    async fn claim_file(&self, filename: &str) -> Result<(PathBuf, tokio::fs::File), SaveError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let path = resolve_unique_path(&self.output_dir, filename);
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                // another task claimed the same name between resolve and open
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SaveError::critical(e.to_string(), Some(path))),
            }
        }
        Err(SaveError::critical(
            format!("could not claim a unique file name for {filename}"),
            Some(self.output_dir.join(filename)),
        ))
    }
}

#[async_trait]
impl ImageSink for FileSink {
    #[instrument(skip(self, buffer, headers), fields(url = %url, bytes = buffer.len()))]
    async fn save(&self, buffer: &[u8], url: &str, headers: &HeaderMap) -> Result<(), SaveError> {
        if buffer.is_empty() {
            return Err(SaveError::ordinary("empty response body"));
        }

        let mime = content_type(headers);
        let filename = image_filename(url, mime.as_deref());
        let (path, mut file) = self.claim_file(&filename).await?;

        let written = async {
            file.write_all(buffer).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "write failed, removing partial file");
            let _ = tokio::fs::remove_file(&path).await;
            return Err(SaveError::critical(e.to_string(), Some(path)));
        }

        self.saved.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        info!(path = %path.display(), "image saved");
        Ok(())
    }
}

/// Keeps buffers in memory, keyed by URL.
#[derive(Debug, Default)]
pub struct MemorySink {
    images: DashMap<String, Vec<u8>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Returns true if nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Returns a copy of the buffer stored for `url`.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.images.get(url).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ImageSink for MemorySink {
    async fn save(&self, buffer: &[u8], url: &str, _headers: &HeaderMap) -> Result<(), SaveError> {
        if buffer.is_empty() {
            return Err(SaveError::ordinary("empty response body"));
        }
        self.images.insert(url.to_string(), buffer.to_vec());
        Ok(())
    }
}
