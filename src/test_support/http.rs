//! Scripted [`LightweightTransport`] for executor and run tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

use crate::download::{DownloadError, HttpResponse, LightweightTransport, RequestHeaders};

#[derive(Debug, Clone)]
enum Canned {
    Body {
        content_type: &'static str,
        body: Vec<u8>,
    },
    Status(u16),
}

/// Answers every URL with an image unless scripted otherwise.
#[derive(Debug, Default)]
pub struct ScriptedHttp {
    canned: Mutex<HashMap<String, Canned>>,
    pub requests: AtomicUsize,
    pub last_referer: Mutex<Option<String>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(self, url: &str, canned: Canned) -> Self {
        self.canned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(url.to_string(), canned);
        self
    }

    pub fn body(self, url: &str, content_type: &'static str, body: &[u8]) -> Self {
        self.insert(
            url,
            Canned::Body {
                content_type,
                body: body.to_vec(),
            },
        )
    }

    pub fn status(self, url: &str, status: u16) -> Self {
        self.insert(url, Canned::Status(status))
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LightweightTransport for ScriptedHttp {
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
        _timeout: Duration,
    ) -> Result<HttpResponse, DownloadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self
            .last_referer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = headers.referer.clone();

        let canned = self
            .canned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(url)
            .cloned()
            .unwrap_or(Canned::Body {
                content_type: "image/png",
                body: b"lightweight-image".to_vec(),
            });

        match canned {
            Canned::Status(status) => Err(DownloadError::http_status(url, status)),
            Canned::Body { content_type, body } => {
                let mut header_map = HeaderMap::new();
                header_map.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                // split into two chunks so callers see a real stream
                let mid = body.len() / 2;
                let chunks = vec![
                    Ok(Bytes::copy_from_slice(&body[..mid])),
                    Ok(Bytes::copy_from_slice(&body[mid..])),
                ];
                Ok(HttpResponse {
                    status: 200,
                    final_url: url.to_string(),
                    headers: header_map,
                    body: stream::iter(chunks).boxed(),
                })
            }
        }
    }
}
