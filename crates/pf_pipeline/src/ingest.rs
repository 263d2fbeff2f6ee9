//! Order ingestion (C9): upstream order fetch, line-item and
//! image materialization, and the hand-off into the download stage.
//!
//! Grounded on `order_ingestion.py` (overall flow: mark Processing, sync,
//! dispatch or finish) and `shopify_sync_service.py` (the per-line-item
//! upsert and the Fotka custom-attribute parsing).

use std::sync::OnceLock;

use regex::Regex;
use sqlx::PgPool;

use pf_core::ids::OrderId;
use pf_core::{PipelineError, Result};
use pf_db::error::DbError;
use pf_db::store;
use pf_events::{EventContext, EventDispatcher, TrackedField, TrackedTx};

use crate::ports::{UpstreamLineItem, UpstreamOrderClient};

fn fotka_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Fotka\s*(?:\(\d+\))?-?(\d+)").unwrap())
}

/// Extracts `(position, url)` pairs from a line item's custom attributes,
/// sorted by position. Keys that don't match the `Fotka` pattern, or whose
/// value isn't an `http(s)` URL, are ignored. Preserved as-is; whether the
/// parenthesised count means anything is unclear (an open question, resolved in DESIGN.md).
pub fn extract_image_urls(attributes: &[(String, String)]) -> Vec<(i32, String)> {
    let re = fotka_pattern();
    let mut found: Vec<(i32, String)> = attributes
        .iter()
        .filter(|(_, value)| value.starts_with("http"))
        .filter_map(|(key, value)| {
            re.captures(key)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .map(|position| (position, value.clone()))
        })
        .collect();
    found.sort_by_key(|(position, _)| *position);
    found
}

/// Always-leading-`#` normalization (an open question, resolved in
/// DESIGN.md): every write of this column goes through here.
pub fn normalize_shopify_order_number(raw: &str) -> String {
    if raw.starts_with('#') {
        raw.to_string()
    } else {
        format!("#{raw}")
    }
}

pub struct IngestOutcome {
    pub order_id: OrderId,
    pub has_images_to_download: bool,
}

/// Fetches `order_number` from the upstream client, upserts the Order and
/// its LineItems/Images, and leaves the order in `Downloading` (images
/// pending) or `ReadyForReview` (no images at all). On any failure past
/// the initial fetch, the order is left in `Error` rather than propagating
/// a half-synced state silently.
pub async fn ingest_order(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    upstream: &dyn UpstreamOrderClient,
    order_number: &str,
) -> Result<IngestOutcome> {
    let upstream_order = upstream.fetch_order(order_number).await?;
    let shopify_order_number = normalize_shopify_order_number(&upstream_order.shopify_order_number);

    let order = match store::find_order_by_shopify_id(pool, upstream_order.upstream_id)
        .await
        .map_err(PipelineError::from)?
    {
        Some(existing) => existing,
        None => store::insert_order(
            pool,
            upstream_order.upstream_id,
            &upstream_order.order_number,
            &shopify_order_number,
        )
        .await
        .map_err(PipelineError::from)?,
    };

    {
        let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
        let mut tracked = TrackedTx::new(tx);
        tracked.set_mercure_context(EventContext::order(order.id.get()));
        store::update_order_status(tracked.transaction_mut(), order.id, pf_core::OrderStatus::Processing)
            .await
            .map_err(PipelineError::from)?;
        store::update_order_metadata(
            tracked.transaction_mut(),
            order.id,
            upstream_order.customer_email.as_deref(),
            upstream_order.customer_name.as_deref(),
            upstream_order.payment_status.as_deref(),
            upstream_order.shipping_method.as_deref(),
        )
        .await
        .map_err(PipelineError::from)?;
        tracked.mark_changed(TrackedField::OrderStatus)?;
        tracked.commit(dispatcher).await?;
    }

    let has_images_to_download = match sync_line_items(pool, order.id, &upstream_order.line_items).await {
        Ok(has_images) => has_images,
        Err(e) => {
            mark_error(pool, dispatcher, order.id).await;
            return Err(e);
        }
    };

    let next_status = if has_images_to_download {
        pf_core::OrderStatus::Downloading
    } else {
        pf_core::OrderStatus::ReadyForReview
    };
    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::order(order.id.get()));
    store::update_order_status(tracked.transaction_mut(), order.id, next_status)
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::OrderStatus)?;
    tracked.commit(dispatcher).await?;

    Ok(IngestOutcome { order_id: order.id, has_images_to_download })
}

/// Idempotent per-line-item upsert: lookup by `upstream_line_item_id`,
/// else allocate the next 1-based `position` and insert. Images are keyed
/// by `(line_item_id, position)`, so re-ingesting the same order never
/// duplicates either (ingesting the same upstream order N times).
async fn sync_line_items(pool: &PgPool, order_id: OrderId, upstream_items: &[UpstreamLineItem]) -> Result<bool> {
    let mut has_images = false;
    for item in upstream_items {
        let line_item = match store::find_line_item_by_upstream_id(pool, order_id, item.upstream_line_item_id)
            .await
            .map_err(PipelineError::from)?
        {
            Some(existing) => existing,
            None => {
                let mut tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
                let upstream_line_item_id = item.upstream_line_item_id;
                let quantity = item.quantity;
                let title = item.title.clone();
                let dedication = item.dedication.clone();
                let layout_tag = item.layout_tag.clone();
                let inserted = pf_db::alloc::next_line_item_position(&mut tx, order_id.get(), {
                    let title = title.clone();
                    let dedication = dedication.clone();
                    let layout_tag = layout_tag.clone();
                    move |position, savepoint| {
                        let title = title.clone();
                        let dedication = dedication.clone();
                        let layout_tag = layout_tag.clone();
                        Box::pin(async move {
                            store::insert_line_item_at(
                                &mut *savepoint,
                                order_id,
                                upstream_line_item_id,
                                position,
                                &title,
                                quantity,
                                dedication.as_deref(),
                                layout_tag.as_deref(),
                            )
                            .await
                            .map_err(DbError::into_sqlx)
                        })
                    }
                })
                .await
                .map_err(PipelineError::from)?;
                tx.commit().await.map_err(|e| PipelineError::Database(e.to_string()))?;
                inserted
            }
        };

        for (position, source_url) in extract_image_urls(&item.custom_attributes) {
            has_images = true;
            if store::find_image_by_position(pool, line_item.id, position)
                .await
                .map_err(PipelineError::from)?
                .is_none()
            {
                store::insert_image(pool, line_item.id, position, &source_url)
                    .await
                    .map_err(PipelineError::from)?;
            }
        }
    }
    Ok(has_images)
}

async fn mark_error(pool: &PgPool, dispatcher: &EventDispatcher, order_id: OrderId) {
    let Ok(tx) = pool.begin().await else { return };
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::order(order_id.get()));
    if store::update_order_status(tracked.transaction_mut(), order_id, pf_core::OrderStatus::Error)
        .await
        .is_err()
    {
        return;
    }
    if tracked.mark_changed(TrackedField::OrderStatus).is_err() {
        return;
    }
    let _ = tracked.commit(dispatcher).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fotka_keys_extract_sorted_positions() {
        let attrs = vec![
            ("Fotka (2)-3".to_string(), "https://cdn/c.jpg".to_string()),
            ("Fotka1".to_string(), "https://cdn/a.jpg".to_string()),
            ("Fotka-2".to_string(), "https://cdn/b.jpg".to_string()),
            ("Unrelated".to_string(), "https://cdn/d.jpg".to_string()),
            ("Fotka 4".to_string(), "not-a-url".to_string()),
        ];
        let urls = extract_image_urls(&attrs);
        assert_eq!(urls, vec![
            (1, "https://cdn/a.jpg".to_string()),
            (2, "https://cdn/b.jpg".to_string()),
            (3, "https://cdn/c.jpg".to_string()),
        ]);
    }

    #[test]
    fn order_number_normalization_adds_leading_hash_once() {
        assert_eq!(normalize_shopify_order_number("1270"), "#1270");
        assert_eq!(normalize_shopify_order_number("#1270"), "#1270");
    }
}
