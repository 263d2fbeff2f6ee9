//! Boot recovery (C8): finds every record left mid-flight by
//! a worker that died, and re-dispatches it with `is_recovery = true`.
//!
//! Grounded on `recovery.py`'s three-part shape: a distributed boot mutex so
//! only one process in the fleet runs recovery at a time, a per-actor
//! `get_incomplete` worklist, and a per-record dedup lock so a second
//! recovery pass inside the same TTL window doesn't re-enqueue work another
//! process already picked up.

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;

use pf_core::ids::{ColoringVersionId, OrderId, SvgVersionId};
use pf_core::{OrderStatus, PipelineError, Result};
use pf_db::store;
use pf_events::EventDispatcher;

use crate::coloring;
use crate::download;
use crate::ingest;
use crate::ports::{DiffusionClient, ImageDownloadClient, ObjectStore, UpstreamOrderClient, VectorizerClient};
use crate::vectorize;

/// The per-record dedup lock's TTL: long enough that a worker still
/// actively reprocessing a record won't have a second recovery pass race
/// in underneath it.
const DEDUP_LOCK_TTL_MINUTES: i64 = 5;

pub struct RecoveryDeps<'a> {
    pub upstream: &'a dyn UpstreamOrderClient,
    pub download_client: &'a dyn ImageDownloadClient,
    pub object_store: &'a dyn ObjectStore,
    pub diffusion: &'a dyn DiffusionClient,
    pub vectorizer: &'a dyn VectorizerClient,
    pub min_image_size: u32,
    pub diffusion_poll_interval: std::time::Duration,
    pub diffusion_timeout: std::time::Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverySummary {
    pub orders: usize,
    pub coloring_versions: usize,
    pub svg_versions: usize,
    pub skipped: usize,
}

/// Runs the boot-mutex election, and if won, recovers every incomplete
/// Order, ColoringVersion, and SvgVersion. Returns an empty summary without
/// doing any work when another process already holds the mutex; this is
/// the expected outcome on most boots in a multi-worker fleet, not an error.
pub async fn run_recovery(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    deps: &RecoveryDeps<'_>,
) -> Result<RecoverySummary> {
    let holder = format!("recovery-{}", std::process::id());
    let won = pf_db::kv::try_acquire_boot_mutex(pool, &holder, ChronoDuration::minutes(DEDUP_LOCK_TTL_MINUTES))
        .await
        .map_err(PipelineError::from)?;
    if !won {
        tracing::info!("recovery boot mutex already held, skipping this process");
        return Ok(RecoverySummary::default());
    }

    let mut summary = RecoverySummary::default();

    for order in store::incomplete_orders(pool).await.map_err(PipelineError::from)? {
        if !claim(pool, "orders", order.id.get()).await? {
            summary.skipped += 1;
            continue;
        }
        if let Err(e) = recover_order(pool, dispatcher, deps, order.id, *order.status, &order.order_number).await {
            tracing::error!(order_id = order.id.get(), error = %e, "order recovery failed");
        } else {
            summary.orders += 1;
        }
    }

    for version in store::incomplete_coloring_versions(pool).await.map_err(PipelineError::from)? {
        if !claim(pool, "coloring_versions", version.id.get()).await? {
            summary.skipped += 1;
            continue;
        }
        if let Err(e) = recover_coloring_version(pool, dispatcher, deps, version.id).await {
            tracing::error!(version_id = version.id.get(), error = %e, "coloring recovery failed");
        } else {
            summary.coloring_versions += 1;
        }
    }

    for version in store::incomplete_svg_versions(pool).await.map_err(PipelineError::from)? {
        if !claim(pool, "svg_versions", version.id.get()).await? {
            summary.skipped += 1;
            continue;
        }
        if let Err(e) = recover_svg_version(pool, dispatcher, deps, version.id).await {
            tracing::error!(version_id = version.id.get(), error = %e, "svg recovery failed");
        } else {
            summary.svg_versions += 1;
        }
    }

    tracing::info!(
        orders = summary.orders,
        coloring_versions = summary.coloring_versions,
        svg_versions = summary.svg_versions,
        skipped = summary.skipped,
        "recovery pass complete"
    );
    Ok(summary)
}

async fn claim(pool: &PgPool, table: &str, record_id: i64) -> Result<bool> {
    pf_db::kv::try_acquire_dedup_lock(pool, table, record_id, ChronoDuration::minutes(DEDUP_LOCK_TTL_MINUTES))
        .await
        .map_err(PipelineError::from)
}

/// An order stuck in `Processing` crashed mid-ingest; re-running
/// `ingest_order` against the same upstream order number is idempotent
/// (it upserts by `shopify_id`). An order stuck in `Downloading` crashed
/// mid-fetch; `download_pending_images` only re-fetches images that never
/// got a `file_ref`, so it resumes rather than re-downloads everything.
async fn recover_order(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    deps: &RecoveryDeps<'_>,
    order_id: OrderId,
    status: OrderStatus,
    order_number: &str,
) -> Result<()> {
    match status {
        OrderStatus::Processing => {
            ingest::ingest_order(pool, dispatcher, deps.upstream, order_number).await?;
            Ok(())
        }
        OrderStatus::Downloading => {
            download::download_pending_images(pool, dispatcher, deps.download_client, deps.object_store, order_id)
                .await
        }
        _ => Ok(()),
    }
}

async fn recover_coloring_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    deps: &RecoveryDeps<'_>,
    coloring_version_id: ColoringVersionId,
) -> Result<()> {
    coloring::process_coloring_version(
        pool,
        dispatcher,
        deps.object_store,
        deps.diffusion,
        deps.min_image_size,
        deps.diffusion_poll_interval,
        deps.diffusion_timeout,
        coloring_version_id,
        true,
    )
    .await
}

async fn recover_svg_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    deps: &RecoveryDeps<'_>,
    svg_version_id: SvgVersionId,
) -> Result<()> {
    vectorize::process_svg_version(pool, dispatcher, deps.object_store, deps.vectorizer, svg_version_id, true).await
}
