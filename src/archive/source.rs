//! Byte sources the archive reader fetches from.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tracing::debug;

use crate::error::TransportError;

/// Called with the cumulative number of bytes received by a transfer.
pub type ByteProgress<'a> = dyn Fn(u64) + Send + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub content_length: u64,
    pub accepts_ranges: bool,
}

#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Learn the size of the resource and whether byte ranges are honored.
    async fn probe(&self, url: &str) -> Result<SourceInfo, TransportError>;

    /// Fetch `range` of the resource. Returns `None` when the source ignored
    /// the range and would have sent the whole resource instead.
    async fn fetch_range(
        &self,
        url: &str,
        range: Range<u64>,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Download the whole resource.
    async fn fetch_all(
        &self,
        url: &str,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Vec<u8>, TransportError>;
}

/// HTTP(S) source backed by `reqwest`.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    async fn read_body(
        url: &str,
        mut response: reqwest::Response,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?
        {
            body.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                progress(body.len() as u64);
            }
        }
        Ok(body)
    }

    fn check_status(url: &str, status: StatusCode) -> Result<(), TransportError> {
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RangeSource for HttpSource {
    async fn probe(&self, url: &str) -> Result<SourceInfo, TransportError> {
        let response =
            self.client
                .head(url)
                .send()
                .await
                .map_err(|source| TransportError::Request {
                    url: url.to_string(),
                    source,
                })?;
        Self::check_status(url, response.status())?;

        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        debug!(url, content_length, accepts_ranges, "Probed archive");
        Ok(SourceInfo {
            // Without a length there is nothing to address ranges against.
            accepts_ranges: accepts_ranges && content_length > 0,
            content_length,
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        range: Range<u64>,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if range.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                Self::read_body(url, response, progress).await.map(Some)
            }
            // Full body instead of a range; dropping the response aborts the transfer.
            StatusCode::OK => Ok(None),
            status => Self::check_status(url, status).map(|_| None),
        }
    }

    async fn fetch_all(
        &self,
        url: &str,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Vec<u8>, TransportError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| TransportError::Request {
                    url: url.to_string(),
                    source,
                })?;
        Self::check_status(url, response.status())?;
        Self::read_body(url, response, progress).await
    }
}

/// In-memory source keyed by URL (or path), with transfer accounting.
///
/// Used for local archives and as a test double for remote hosts.
pub struct MemorySource {
    objects: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    ranges: bool,
    chunk_size: usize,
    chunk_delay: Duration,
    bytes_served: AtomicU64,
    probes: AtomicUsize,
    range_requests: AtomicUsize,
    full_requests: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            ranges: true,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            bytes_served: AtomicU64::new(0),
            probes: AtomicUsize::new(0),
            range_requests: AtomicUsize::new(0),
            full_requests: AtomicUsize::new(0),
        }
    }

    /// Behave like a host that ignores `Range` headers.
    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Deliver bodies in `chunk_size` pieces, sleeping `delay` before each.
    pub fn with_throttle(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), Arc::new(bytes));
    }

    pub fn remove(&self, url: &str) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn full_requests(&self) -> usize {
        self.full_requests.load(Ordering::SeqCst)
    }

    fn object(&self, url: &str) -> Result<Arc<Vec<u8>>, TransportError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(url.to_string()))
    }

    async fn deliver(&self, bytes: &[u8], progress: Option<&ByteProgress<'_>>) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len());
        for chunk in bytes.chunks(self.chunk_size) {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            out.extend_from_slice(chunk);
            self.bytes_served
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
            if let Some(progress) = progress {
                progress(out.len() as u64);
            }
        }
        out
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn probe(&self, url: &str) -> Result<SourceInfo, TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let object = self.object(url)?;
        Ok(SourceInfo {
            content_length: object.len() as u64,
            accepts_ranges: self.ranges,
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        range: Range<u64>,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let object = self.object(url)?;
        if !self.ranges {
            return Ok(None);
        }
        self.range_requests.fetch_add(1, Ordering::SeqCst);

        let end = range.end.min(object.len() as u64) as usize;
        let start = (range.start as usize).min(end);
        Ok(Some(self.deliver(&object[start..end], progress).await))
    }

    async fn fetch_all(
        &self,
        url: &str,
        progress: Option<&ByteProgress<'_>>,
    ) -> Result<Vec<u8>, TransportError> {
        let object = self.object(url)?;
        self.full_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.deliver(&object, progress).await)
    }
}
