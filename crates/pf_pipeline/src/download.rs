//! Image download (C9): fetches every pending source image
//! for an order into our own object storage, bounded-concurrency, then
//! flips the order to `ReadyForReview` or `Error`.
//!
//! Grounded on `download_service.py`/`config.py`: a per-host deterministic
//! User-Agent/Accept-Language pick, a fixed set of HTTP statuses that
//! trigger a proxy-mode retry rather than a backoff retry, and a separate
//! bounded retry for genuine transport failures. MD5 in the source becomes
//! SHA-256 here (already a workspace dependency; the property that matters
//! is "deterministic per host", not the specific digest).

use std::time::Duration;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use pf_core::ids::{ImageId, OrderId};
use pf_core::{PipelineError, Result};
use pf_db::store;
use pf_events::{EventContext, EventDispatcher, TrackedField, TrackedTx};

use crate::paths;
use crate::ports::{DownloadError, ImageDownloadClient, ObjectStore};

/// Statuses the source CDN returns when it's blocking the direct fetch
/// path; worth falling back to a proxy, not worth a backoff retry.
const RETRYABLE_STATUS_CODES: [u16; 5] = [403, 429, 525, 526, 530];
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_DOWNLOADS: usize = 8;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
];
const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "cs-CZ,cs;q=0.9,en;q=0.7"];

/// Deterministically picks a `(user_agent, accept_language)` pair for
/// `host` so repeated fetches of the same host look like one consistent
/// client across retries, instead of rotating per-request.
fn select_for_host(host: &str, seed: &str) -> (&'static str, &'static str) {
    let digest = Sha256::digest(format!("{host}:{seed}").as_bytes());
    let index = digest[0] as usize;
    (USER_AGENTS[index % USER_AGENTS.len()], ACCEPT_LANGUAGES[index % ACCEPT_LANGUAGES.len()])
}

fn host_of(url: &str) -> String {
    url.split("//").nth(1).and_then(|rest| rest.split('/').next()).unwrap_or(url).to_string()
}

async fn write_file_ref(
    exec: impl sqlx::PgExecutor<'_>,
    image_id: ImageId,
    put: &crate::ports::PutOutcome,
    content_type: &str,
    original_filename: &str,
) -> pf_db::error::Result<()> {
    let file_ref = pf_core::FileRef {
        key: put.key.clone(),
        bucket: put.bucket.clone(),
        content_type: content_type.to_string(),
        size: put.size,
        etag: put.etag.clone(),
        sha256: put.sha256.clone(),
        original_filename: Some(original_filename.to_string()),
    };
    sqlx::query("UPDATE images SET file_ref = $1, uploaded_at = now() WHERE id = $2")
        .bind(file_ref)
        .bind(image_id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Downloads every pending image for `order_id`, with up to
/// `MAX_CONCURRENT_DOWNLOADS` in flight, then transitions the order to
/// `ReadyForReview` (all succeeded) or `Error` (any failed).
pub async fn download_pending_images(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    client: &dyn ImageDownloadClient,
    store_: &dyn ObjectStore,
    order_id: OrderId,
) -> Result<()> {
    let images = store::images_pending_download(pool, order_id).await.map_err(PipelineError::from)?;
    let line_items = store::list_line_items(pool, order_id).await.map_err(PipelineError::from)?;
    let position_of: std::collections::HashMap<_, _> =
        line_items.iter().map(|li| (li.id, li.position)).collect();

    let results: Vec<Result<()>> = stream::iter(images.iter())
        .map(|image| {
            let position = *position_of.get(&image.line_item_id).unwrap_or(&0);
            async move { download_one_tracked(client, store_, pool, dispatcher, order_id, position, image).await }
        })
        .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
        .collect()
        .await;

    let any_failed = results.iter().any(|r| r.is_err());
    for r in &results {
        if let Err(e) = r {
            tracing::warn!(error = %e, order_id = order_id.get(), "image download failed");
        }
    }

    let next_status = if any_failed { pf_core::OrderStatus::Error } else { pf_core::OrderStatus::ReadyForReview };
    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::order(order_id.get()));
    store::update_order_status(tracked.transaction_mut(), order_id, next_status)
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::OrderStatus)?;
    tracked.commit(dispatcher).await?;

    if any_failed {
        return Err(PipelineError::UpstreamUnavailable("one or more images failed to download".into()));
    }
    Ok(())
}

async fn download_one_tracked(
    client: &dyn ImageDownloadClient,
    store_: &dyn ObjectStore,
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    order_id: OrderId,
    line_item_position: i32,
    image: &pf_db::models::Image,
) -> Result<()> {
    let host = host_of(&image.source_url);
    let (user_agent, accept_language) = select_for_host(&host, &image.id.to_string());

    let mut via_proxy = false;
    let mut last_err: Option<DownloadError> = None;
    for attempt in 1..=MAX_TRANSPORT_ATTEMPTS {
        match client.fetch(&image.source_url, user_agent, accept_language, via_proxy).await {
            Ok((bytes, content_type)) => {
                let ext = content_type
                    .split('/')
                    .nth(1)
                    .map(str::to_string)
                    .unwrap_or_else(|| paths::extension_from_url(&image.source_url));
                let key = paths::original_image(order_id.get(), line_item_position, image.position, &ext);
                let put = store_.put(&key, &bytes, &content_type).await?;

                let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
                let mut tracked = TrackedTx::new(tx);
                tracked.set_mercure_context(EventContext::image(order_id.get(), image.id.get()));
                write_file_ref(tracked.transaction_mut(), image.id, &put, &content_type, &image.source_url)
                    .await
                    .map_err(PipelineError::from)?;
                tracked.mark_changed(TrackedField::ImageFileRef)?;
                tracked.commit(dispatcher).await?;
                return Ok(());
            }
            Err(DownloadError::Status(code, msg)) if RETRYABLE_STATUS_CODES.contains(&code) && !via_proxy => {
                tracing::warn!(code, host = %host, "blocked on direct fetch, retrying via proxy");
                via_proxy = true;
                last_err = Some(DownloadError::Status(code, msg));
                continue;
            }
            Err(e @ DownloadError::Status(..)) => {
                return Err(e.into());
            }
            Err(DownloadError::Transport(msg)) => {
                last_err = Some(DownloadError::Transport(msg.clone()));
                if attempt == MAX_TRANSPORT_ATTEMPTS {
                    break;
                }
                let backoff = (MIN_BACKOFF * 2u32.pow(attempt - 1)).min(MAX_BACKOFF);
                tracing::warn!(attempt, error = %msg, "transport error, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
    Err(last_err.map(Into::into).unwrap_or_else(|| PipelineError::UpstreamUnavailable("download failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_selection_is_deterministic_per_host() {
        let a = select_for_host("cdn.example.com", "1");
        let b = select_for_host("cdn.example.com", "1");
        assert_eq!(a, b);
    }

    #[test]
    fn host_extraction_strips_scheme_and_path() {
        assert_eq!(host_of("https://cdn.example.com/a/b.jpg"), "cdn.example.com");
    }
}
