//! Production adapters for the five `ports` traits: plain HTTP clients, one
//! per external collaborator, the way `pf_events::hub::HttpSseHub` is the
//! production adapter for `SseHub`. Grounded directly on
//! `original_source/backend/app/services/{runpod,external/vectorizer,
//! download}.py`'s request shape, ported from `httpx` to `reqwest`.
//!
//! Object storage has no S3 crate anywhere in the example pack this crate
//! was built against, so [`FilesystemObjectStore`] stands in for the
//! source system's `S3StorageService`; a real, local-disk-backed
//! implementation behind the same [`ObjectStore`] contract, swappable for
//! an S3 client later without touching a call site.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use pf_core::{PipelineError, Result};

use crate::ports::{
    DiffusionClient, DiffusionOutcome, DownloadError, ImageDownloadClient, ObjectStore, PutOutcome, StatusSink,
    UpstreamLineItem, UpstreamOrder, UpstreamOrderClient, VectorizerClient, VectorizerError,
};

/// Shopify-like upstream order API, reached by order number.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    store_handle: String,
    access_token: String,
}

impl HttpUpstreamClient {
    pub fn new(store_handle: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), store_handle: store_handle.into(), access_token: access_token.into() }
    }
}

#[derive(Deserialize)]
struct UpstreamOrderBody {
    id: i64,
    order_number: String,
    name: String,
    email: Option<String>,
    customer_name: Option<String>,
    financial_status: Option<String>,
    shipping_method: Option<String>,
    line_items: Vec<UpstreamLineItemBody>,
}

#[derive(Deserialize)]
struct UpstreamLineItemBody {
    id: i64,
    title: String,
    quantity: i32,
    dedication: Option<String>,
    layout_tag: Option<String>,
    #[serde(default)]
    properties: Vec<UpstreamPropertyBody>,
}

#[derive(Deserialize)]
struct UpstreamPropertyBody {
    name: String,
    value: String,
}

#[async_trait]
impl UpstreamOrderClient for HttpUpstreamClient {
    async fn fetch_order(&self, order_number: &str) -> Result<UpstreamOrder> {
        let url = format!("https://{}.myshopify.com/admin/api/orders/{order_number}.json", self.store_handle);
        let response = self
            .client
            .get(&url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::not_found(format!("upstream order {order_number}")));
        }
        if !response.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!("upstream responded {}", response.status())));
        }

        let body: UpstreamOrderBody =
            response.json().await.map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
        Ok(UpstreamOrder {
            upstream_id: body.id,
            order_number: body.order_number,
            shopify_order_number: body.name,
            customer_email: body.email,
            customer_name: body.customer_name,
            payment_status: body.financial_status,
            shipping_method: body.shipping_method,
            line_items: body
                .line_items
                .into_iter()
                .map(|li| UpstreamLineItem {
                    upstream_line_item_id: li.id,
                    title: li.title,
                    quantity: li.quantity,
                    dedication: li.dedication,
                    layout_tag: li.layout_tag,
                    custom_attributes: li.properties.into_iter().map(|p| (p.name, p.value)).collect(),
                })
                .collect(),
        })
    }
}

/// Fetches a source image directly, or through `proxy_url` when
/// `via_proxy` is set; mirroring `download_service.py`'s two-client split.
pub struct HttpImageDownloadClient {
    client: reqwest::Client,
    proxy_url: Option<String>,
}

impl HttpImageDownloadClient {
    pub fn new(proxy_url: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), proxy_url }
    }
}

#[async_trait]
impl ImageDownloadClient for HttpImageDownloadClient {
    async fn fetch(
        &self,
        url: &str,
        user_agent: &str,
        accept_language: &str,
        via_proxy: bool,
    ) -> std::result::Result<(Vec<u8>, String), DownloadError> {
        let target = match (via_proxy, &self.proxy_url) {
            (true, Some(proxy)) => format!("{proxy}?url={}", urlencoding_minimal(url)),
            _ => url.to_string(),
        };

        let response = self
            .client
            .get(&target)
            .header("User-Agent", user_agent)
            .header("Accept-Language", accept_language)
            .send()
            .await
            .map_err(|e| DownloadError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownloadError::Status(status.as_u16(), body));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await.map_err(|e| DownloadError::Transport(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

/// Minimal percent-encoding for the one query value the proxy fallback
/// needs; not a general-purpose URL encoder.
fn urlencoding_minimal(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            other => other.to_string().bytes().map(|b| format!("%{b:02X}")).collect(),
        })
        .collect()
}

/// RunPod-style diffusion backend: submit, then poll
/// `/status/{job_id}` until a terminal state.
pub struct RunpodDiffusionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RunpodDiffusionClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into(), api_key: api_key.into() }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }
}

#[derive(serde::Serialize)]
struct RunpodSubmitInput {
    image: String,
    megapixels: f64,
    steps: u32,
}

#[derive(serde::Serialize)]
struct RunpodSubmitBody {
    input: RunpodSubmitInput,
}

#[derive(Deserialize)]
struct RunpodSubmitResponse {
    id: Option<String>,
}

#[derive(Deserialize)]
struct RunpodStatusResponse {
    status: String,
    output: Option<RunpodOutput>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RunpodOutput {
    image: Option<String>,
}

#[async_trait]
impl DiffusionClient for RunpodDiffusionClient {
    async fn submit_job(&self, image: &[u8], megapixels: f64, steps: u32) -> Result<String> {
        let body = RunpodSubmitBody {
            input: RunpodSubmitInput {
                image: base64::engine::general_purpose::STANDARD.encode(image),
                megapixels,
                steps,
            },
        };
        let response = self
            .auth(self.client.post(format!("{}/run", self.endpoint)))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!("runpod submit responded {}", response.status())));
        }
        let parsed: RunpodSubmitResponse =
            response.json().await.map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
        parsed.id.ok_or_else(|| PipelineError::UpstreamUnavailable("no job id in runpod response".into()))
    }

    async fn poll_job(
        &self,
        job_id: &str,
        timeout: Duration,
        poll_interval: Duration,
        sink: &dyn StatusSink,
    ) -> Result<DiffusionOutcome> {
        let start = tokio::time::Instant::now();
        let mut last_status = String::new();
        loop {
            if start.elapsed() > timeout {
                return Err(PipelineError::Timeout(timeout));
            }
            let response = self
                .auth(self.client.get(format!("{}/status/{job_id}", self.endpoint)))
                .send()
                .await
                .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
            if !response.status().is_success() {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            let parsed: RunpodStatusResponse =
                response.json().await.map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;

            if parsed.status != last_status {
                sink.on_status(&parsed.status).await;
                last_status = parsed.status.clone();
            }

            match parsed.status.as_str() {
                "COMPLETED" => {
                    let image_b64 = parsed
                        .output
                        .and_then(|o| o.image)
                        .ok_or_else(|| PipelineError::UpstreamUnavailable("no image in completed output".into()))?;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(image_b64)
                        .map_err(|e| PipelineError::UpstreamUnavailable(e.to_string()))?;
                    return Ok(DiffusionOutcome::Completed(bytes));
                }
                "FAILED" => {
                    return Ok(DiffusionOutcome::Failed(parsed.error.unwrap_or_else(|| "unknown error".into())));
                }
                _ => tokio::time::sleep(poll_interval).await,
            }
        }
    }
}

/// Vectorizer.ai-style multipart API: HTTP 400 is permanent,
/// anything else is transient.
pub struct VectorizerHttpClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    api_secret: String,
}

impl VectorizerHttpClient {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into(), api_key: api_key.into(), api_secret: api_secret.into() }
    }
}

#[async_trait]
impl VectorizerClient for VectorizerHttpClient {
    async fn vectorize(
        &self,
        image: &[u8],
        filename: &str,
        shape_stacking: &str,
        group_by: &str,
    ) -> std::result::Result<Vec<u8>, VectorizerError> {
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(filename.to_string())
            .mime_str("image/png")
            .map_err(|e| VectorizerError::Transient(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("output.shape_stacking", shape_stacking.to_string())
            .text("output.group_by", group_by.to_string())
            .text("output.parameterized_shapes.flatten", "true");

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .multipart(form)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| VectorizerError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                response.bytes().await.map(|b| b.to_vec()).map_err(|e| VectorizerError::Transient(e.to_string()))
            }
            status if status.as_u16() == 400 => {
                let body = response.text().await.unwrap_or_default();
                Err(VectorizerError::BadRequest(body))
            }
            status => Err(VectorizerError::Transient(format!("vectorizer responded {status}"))),
        }
    }
}

/// Local-disk object store standing in for the source system's S3 bucket:
/// `root/key` holds the bytes, content type is tracked only implicitly by
/// the caller (matching `FileRef` not carrying one either).
pub struct FilesystemObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self { root: root.into(), bucket: bucket.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<PutOutcome> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| PipelineError::Database(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| PipelineError::Database(e.to_string()))?;

        let sha256 = format!("{:x}", Sha256::digest(bytes));
        Ok(PutOutcome {
            key: key.to_string(),
            bucket: self.bucket.clone(),
            etag: sha256[..32].to_string(),
            sha256,
            size: bytes.len() as i64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(key))
            .await
            .map_err(|_| PipelineError::not_found(format!("object {key}")))
    }
}
