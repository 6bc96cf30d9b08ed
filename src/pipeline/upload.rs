//! Multipart image upload with byte-level progress.
//!
//! The image is split into fixed-size chunks and streamed as the `file` part
//! of a multipart body. Each time a chunk is handed to the HTTP client the
//! progress callback receives `floor(sent / total * 100)`. Reports are
//! non-decreasing, end at exactly 100 once the last chunk is handed over,
//! and stop as soon as the response has arrived.

use crate::error::RepromptError;
use crate::output::UploadResult;
use crate::pipeline::input::ImageFile;
use crate::pipeline::transport::classify;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Callback receiving upload progress in whole percent.
pub type UploadProgress = Arc<dyn Fn(u8) + Send + Sync>;

/// Sends an image to the service's upload endpoint.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `file`. A well-formed `success: false` answer is returned as
    /// `Ok`; only transport, HTTP and parse failures are `Err`.
    async fn upload(
        &self,
        file: &ImageFile,
        on_progress: UploadProgress,
    ) -> Result<UploadResult, RepromptError>;
}

/// [`Uploader`] posting `multipart/form-data` with reqwest.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    url: String,
    timeout: Duration,
    chunk_bytes: usize,
}

impl HttpUploader {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration, chunk_bytes: usize) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        file: &ImageFile,
        on_progress: UploadProgress,
    ) -> Result<UploadResult, RepromptError> {
        let total = file.len();
        debug!("Uploading '{}' ({} bytes) to {}", file.name(), total, self.url);

        let finished = Arc::new(AtomicBool::new(false));
        let body = progress_body(
            file.bytes().clone(),
            self.chunk_bytes,
            on_progress,
            Arc::clone(&finished),
        );

        let part = Part::stream_with_length(body, total)
            .file_name(file.name().to_string())
            .mime_str(file.mime())
            .map_err(|e| RepromptError::Internal(format!("invalid MIME type: {e}")))?;
        let form = Form::new().part("file", part);

        let sent = self
            .client
            .post(&self.url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await;
        finished.store(true, Ordering::SeqCst);
        let response = sent.map_err(|e| classify(&self.url, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RepromptError::Http {
                url: self.url.clone(),
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| classify(&self.url, self.timeout, e))?;
        serde_json::from_str(&text).map_err(|e| RepromptError::Parse {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }
}

/// Wrap the image bytes in a chunked body stream that reports progress.
fn progress_body(
    bytes: Bytes,
    chunk_bytes: usize,
    on_progress: UploadProgress,
    finished: Arc<AtomicBool>,
) -> Body {
    let total = bytes.len() as u64;
    let chunks = chunk(bytes, chunk_bytes);
    let mut sent: u64 = 0;
    let mut last: Option<u8> = None;

    let stream = stream::iter(chunks).map(move |piece| {
        sent += piece.len() as u64;
        let pct = percent(sent, total);
        if last != Some(pct) && !finished.load(Ordering::SeqCst) {
            last = Some(pct);
            on_progress(pct);
        }
        Ok::<Bytes, std::io::Error>(piece)
    });
    Body::wrap_stream(stream)
}

/// Split without copying; `Bytes::slice` shares the allocation.
fn chunk(bytes: Bytes, size: usize) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(bytes.len() / size + 1);
    let mut start = 0;
    while start < bytes.len() {
        let end = (start + size).min(bytes.len());
        out.push(bytes.slice(start..end));
        start = end;
    }
    out
}

/// `floor(sent / total * 100)`, capped at 100.
fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as u128 * 100) / total as u128).min(100) as u8
}
