//! Streaming downloader
//!
//! Key principles:
//! - The response body is consumed incrementally, never buffered whole
//! - Progress comes from bytes received vs. Content-Length when known
//! - Every read races the cancellation token, so an abort drops the
//!   in-flight request instead of waiting for the next byte
//! - The downloader never writes anywhere; the scheduler owns the sink

use crate::error::ExportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ceiling for time-based progress when the body size is unknown
const INDETERMINATE_CEILING: f64 = 95.0;

/// Time constant of the time-based progress curve
const INDETERMINATE_TAU_SECS: f64 = 30.0;

/// Opens a download for a resolved link
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, url: &url::Url, cancel: &CancellationToken) -> Result<DownloadBody, ExportError>;
}

/// A response body being read incrementally.
///
/// Finite and not restartable: once `next_chunk` returns `Ok(None)` the
/// body is done, and a retry needs a fresh `fetch`.
pub struct DownloadBody {
    stream: BoxStream<'static, Result<Bytes, ExportError>>,
    total: Option<u64>,
    received: u64,
    started: Instant,
    cancel: CancellationToken,
    percentage: f64,
    finished: bool,
}

impl DownloadBody {
    pub fn new(
        stream: BoxStream<'static, Result<Bytes, ExportError>>,
        total: Option<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            total,
            received: 0,
            started: Instant::now(),
            cancel,
            percentage: 0.0,
            finished: false,
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// Progress in percent, never decreasing
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Read the next byte range, or `None` at the end of the body
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ExportError> {
        if self.finished {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ExportError::Cancelled),
            next = self.stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                self.received += bytes.len() as u64;
                self.update_percentage();
                Ok(Some(bytes))
            }
            Some(Err(e)) => Err(e),
            None => {
                self.finished = true;
                self.percentage = 100.0;
                Ok(None)
            }
        }
    }

    fn update_percentage(&mut self) {
        let estimate = match self.total {
            Some(total) if total > 0 => (self.received as f64 / total as f64 * 100.0).min(100.0),
            _ => {
                let elapsed = self.started.elapsed().as_secs_f64();
                INDETERMINATE_CEILING * (1.0 - (-elapsed / INDETERMINATE_TAU_SECS).exp())
            }
        };
        if estimate > self.percentage {
            self.percentage = estimate;
        }
    }
}

/// Downloader over plain HTTP(S) GET
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    /// No overall timeout: a hung transfer ends only through cancellation
    pub fn new() -> Result<Self, ExportError> {
        let client = Client::builder()
            .user_agent("VExport/0.1.0")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExportError::Network(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &url::Url, cancel: &CancellationToken) -> Result<DownloadBody, ExportError> {
        debug!("Fetching {}", url);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            response = self.client.get(url.clone()).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::DownloadFailed {
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        debug!("Response from {}: status={}, content_length={:?}", url, status, total);

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ExportError::Network(e.to_string())))
            .boxed();

        Ok(DownloadBody::new(stream, total, cancel.clone()))
    }
}
