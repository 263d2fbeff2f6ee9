//! External collaborator traits: the pipeline services depend on
//! these, never on a concrete HTTP client. Production implementations live
//! in [`crate::adapters`]; [`fake`] provides the in-memory doubles the
//! test suite drives instead.

use std::time::Duration;

use async_trait::async_trait;
use pf_core::{PipelineError, Result};

/// One upstream line item, already carrying whatever custom attributes the
/// ingest actor needs to derive image URLs from.
#[derive(Debug, Clone)]
pub struct UpstreamLineItem {
    pub upstream_line_item_id: i64,
    pub title: String,
    pub quantity: i32,
    pub dedication: Option<String>,
    pub layout_tag: Option<String>,
    /// Raw custom-attribute pairs, e.g. Shopify's `properties` list, before
    /// the `Fotka` key pattern is applied.
    pub custom_attributes: Vec<(String, String)>,
}

/// One upstream order, as fetched by order number (ingest) or
/// decoded from a webhook body (`/webhooks/shopify`).
#[derive(Debug, Clone)]
pub struct UpstreamOrder {
    pub upstream_id: i64,
    pub order_number: String,
    pub shopify_order_number: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub payment_status: Option<String>,
    pub shipping_method: Option<String>,
    pub line_items: Vec<UpstreamLineItem>,
}

#[async_trait]
pub trait UpstreamOrderClient: Send + Sync {
    async fn fetch_order(&self, order_number: &str) -> Result<UpstreamOrder>;
}

/// A written object, returned by [`ObjectStore::put`] for the caller to
/// persist as a `FileRef` column.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub key: String,
    pub bucket: String,
    pub etag: String,
    pub sha256: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<PutOutcome>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Terminal outcome of a diffusion job, reported by the remote service
/// itself rather than inferred from a lack of further status changes.
pub enum DiffusionOutcome {
    Completed(Vec<u8>),
    Failed(String),
}

/// Receives status-change notifications from [`DiffusionClient::poll_job`].
/// A trait (rather than a plain closure) because advancing the
/// ColoringVersion row on each change requires its own short lock; an
/// async operation a bare `Fn` can't express as a trait object.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn on_status(&self, status: &str);
}

#[async_trait]
pub trait DiffusionClient: Send + Sync {
    /// Submits one coloring job; returns the remote job handle.
    async fn submit_job(&self, image: &[u8], megapixels: f64, steps: u32) -> Result<String>;

    /// Polls `job_id` until it reaches a terminal state or `timeout`
    /// elapses. `sink` is notified only when the remote status differs
    /// from the previous poll (ported from `runpod.py`'s change-only
    /// callback); callers use it to advance the ColoringVersion's status
    /// column without writing on every poll tick.
    async fn poll_job(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
        sink: &dyn StatusSink,
    ) -> Result<DiffusionOutcome>;
}

/// Vectorizer-specific error: HTTP 400 is a `throws` precondition failure
/// (bad input image), anything else is transient and worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum VectorizerError {
    #[error("vectorizer rejected the input: {0}")]
    BadRequest(String),
    #[error("vectorizer request failed: {0}")]
    Transient(String),
}

impl From<VectorizerError> for PipelineError {
    fn from(e: VectorizerError) -> Self {
        match e {
            VectorizerError::BadRequest(msg) => PipelineError::Permanent(msg),
            VectorizerError::Transient(msg) => PipelineError::UpstreamUnavailable(msg),
        }
    }
}

#[async_trait]
pub trait VectorizerClient: Send + Sync {
    async fn vectorize(
        &self,
        image: &[u8],
        filename: &str,
        shape_stacking: &str,
        group_by: &str,
    ) -> std::result::Result<Vec<u8>, VectorizerError>;
}

/// Source-image fetch error, distinguishing an HTTP status worth falling
/// back to a proxy for (`RETRYABLE_STATUS_CODES`) from a transport
/// failure worth a bounded retry.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("source returned HTTP {0}: {1}")]
    Status(u16, String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<DownloadError> for PipelineError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Status(code, msg) => PipelineError::UpstreamUnavailable(format!("{code}: {msg}")),
            DownloadError::Transport(msg) => PipelineError::UpstreamUnavailable(msg),
        }
    }
}

/// Fetches a source image from wherever the order's upstream CDN hosts it.
/// Kept distinct from [`ObjectStore`] (our own bucket) and from the
/// upstream order API; grounded on `download_service.py`'s direct/proxy
/// client split, collapsed here to one trait with a `via_proxy` switch.
#[async_trait]
pub trait ImageDownloadClient: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        user_agent: &str,
        accept_language: &str,
        via_proxy: bool,
    ) -> std::result::Result<(Vec<u8>, String), DownloadError>;
}

/// In-memory test doubles for all five ports above; what the test suite
/// drives instead of the real adapters in [`crate::adapters`].
pub mod fake {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeUpstreamClient {
        pub orders: Mutex<HashMap<String, UpstreamOrder>>,
    }

    impl FakeUpstreamClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, order: UpstreamOrder) {
            self.orders.lock().unwrap().insert(order.order_number.clone(), order);
        }
    }

    #[async_trait]
    impl UpstreamOrderClient for FakeUpstreamClient {
        async fn fetch_order(&self, order_number: &str) -> Result<UpstreamOrder> {
            self.orders
                .lock()
                .unwrap()
                .get(order_number)
                .cloned()
                .ok_or_else(|| PipelineError::not_found(format!("upstream order {order_number}")))
        }
    }

    #[derive(Default)]
    pub struct FakeObjectStore {
        pub bucket: String,
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeObjectStore {
        pub fn new(bucket: impl Into<String>) -> Self {
            Self { bucket: bucket.into(), objects: Mutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<PutOutcome> {
            let sha256 = format!("{:x}", Sha256::digest(bytes));
            let etag = sha256[..32].to_string();
            let size = bytes.len() as i64;
            self.objects.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(PutOutcome { key: key.to_string(), bucket: self.bucket.clone(), etag, sha256, size })
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| PipelineError::not_found(format!("object {key}")))
        }
    }

    /// A scripted RunPod-style client: jobs complete after a fixed number
    /// of polls, or can be configured to fail.
    pub struct FakeDiffusionClient {
        pub polls_until_complete: u32,
        pub output: Vec<u8>,
        pub fail_with: Option<String>,
        next_job_id: Mutex<u64>,
    }

    impl FakeDiffusionClient {
        pub fn new(polls_until_complete: u32, output: Vec<u8>) -> Self {
            Self { polls_until_complete, output, fail_with: None, next_job_id: Mutex::new(1) }
        }

        pub fn failing(mut self, message: impl Into<String>) -> Self {
            self.fail_with = Some(message.into());
            self
        }
    }

    #[async_trait]
    impl DiffusionClient for FakeDiffusionClient {
        async fn submit_job(&self, _image: &[u8], _megapixels: f64, _steps: u32) -> Result<String> {
            let mut n = self.next_job_id.lock().unwrap();
            let id = format!("job-{n}");
            *n += 1;
            Ok(id)
        }

        async fn poll_job(
            &self,
            _job_id: &str,
            timeout: Duration,
            poll_interval: Duration,
            sink: &dyn StatusSink,
        ) -> Result<DiffusionOutcome> {
            let start = tokio::time::Instant::now();
            let mut last_status = String::new();
            for tick in 0..self.polls_until_complete.max(1) {
                if start.elapsed() > timeout {
                    return Err(PipelineError::Timeout(timeout));
                }
                let status = if tick + 1 < self.polls_until_complete { "IN_QUEUE" } else { "IN_PROGRESS" };
                if status != last_status {
                    sink.on_status(status).await;
                    last_status = status.to_string();
                }
                if poll_interval > Duration::ZERO {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            if let Some(message) = &self.fail_with {
                sink.on_status("FAILED").await;
                return Ok(DiffusionOutcome::Failed(message.clone()));
            }
            sink.on_status("COMPLETED").await;
            Ok(DiffusionOutcome::Completed(self.output.clone()))
        }
    }

    /// Serves fixed bytes per URL, or a scripted status/transport failure
    /// for a given URL so `download.rs`'s fallback/retry paths can be
    /// exercised deterministically.
    #[derive(Default)]
    pub struct FakeImageDownloadClient {
        pub bodies: Mutex<HashMap<String, Vec<u8>>>,
        pub status_failures: Mutex<HashMap<String, (u16, u32)>>,
        pub transport_failures: Mutex<HashMap<String, u32>>,
    }

    impl FakeImageDownloadClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn serve(&self, url: impl Into<String>, bytes: Vec<u8>) {
            self.bodies.lock().unwrap().insert(url.into(), bytes);
        }

        /// Fails the first `times` attempts at `url` with `status`, then
        /// (once attempts are exhausted) serves whatever body is seeded.
        pub fn fail_with_status(&self, url: impl Into<String>, status: u16, times: u32) {
            self.status_failures.lock().unwrap().insert(url.into(), (status, times));
        }

        pub fn fail_transport(&self, url: impl Into<String>, times: u32) {
            self.transport_failures.lock().unwrap().insert(url.into(), times);
        }
    }

    #[async_trait]
    impl ImageDownloadClient for FakeImageDownloadClient {
        async fn fetch(
            &self,
            url: &str,
            _user_agent: &str,
            _accept_language: &str,
            _via_proxy: bool,
        ) -> std::result::Result<(Vec<u8>, String), DownloadError> {
            if let Some(remaining) = self.transport_failures.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DownloadError::Transport("connection reset".into()));
                }
            }
            if let Some((status, remaining)) = self.status_failures.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DownloadError::Status(*status, "blocked".into()));
                }
            }
            self.bodies
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .map(|bytes| (bytes, "image/jpeg".to_string()))
                .ok_or_else(|| DownloadError::Status(404, "not seeded".into()))
        }
    }

    pub struct FakeVectorizerClient {
        pub bad_request: bool,
        pub output: Vec<u8>,
    }

    impl FakeVectorizerClient {
        pub fn new(output: Vec<u8>) -> Self {
            Self { bad_request: false, output }
        }

        pub fn rejecting() -> Self {
            Self { bad_request: true, output: Vec::new() }
        }
    }

    #[async_trait]
    impl VectorizerClient for FakeVectorizerClient {
        async fn vectorize(
            &self,
            _image: &[u8],
            _filename: &str,
            _shape_stacking: &str,
            _group_by: &str,
        ) -> std::result::Result<Vec<u8>, VectorizerError> {
            if self.bad_request {
                return Err(VectorizerError::BadRequest("unsupported image format".into()));
            }
            Ok(self.output.clone())
        }
    }
}
