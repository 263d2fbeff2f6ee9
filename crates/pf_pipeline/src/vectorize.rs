//! SVG generation (C9): the Vectorizer.ai state machine. Same
//! lock-then-call-outside-the-lock shape as [`crate::coloring`], minus the
//! submit/poll split; one synchronous vectorize call replaces the RunPod
//! job lifecycle. Source bytes come from the SvgVersion's own
//! `coloring_version_id`, not from the image's original upload.

use sqlx::PgPool;

use pf_core::ids::{ImageId, SvgVersionId};
use pf_core::{PipelineError, ProcessingStatus, Result, SvgStatus};
use pf_db::error::DbError;
use pf_db::lock::Lock;
use pf_db::models::SvgVersion;
use pf_db::store;
use pf_events::{Event, EventContext, EventDispatcher, StatusType, TrackedField, TrackedTx};

use crate::paths;
use crate::ports::VectorizerClient;

/// Entry point: drives `svg_version_id` through as much of the state
/// machine as a single call can complete. Any failure from the external
/// calls (fetch, vectorize, upload) moves the record to Error before
/// propagating, so it never sits stuck in an awaiting-external state
/// outside the recovery sweep's reach.
pub async fn process_svg_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    store_: &dyn crate::ports::ObjectStore,
    vectorizer: &dyn VectorizerClient,
    svg_version_id: SvgVersionId,
    is_recovery: bool,
) -> Result<()> {
    let Some(mut lock) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get())
        .await
        .map_err(PipelineError::from)?
    else {
        return Err(PipelineError::not_found(format!("svg version {svg_version_id}")));
    };

    if lock.record().file_ref.is_some() {
        let current = *lock.record().status;
        tracing::warn!(version_id = svg_version_id.get(), "already has file_ref, marking completed");
        lock.verify_and_update_status(&[current], SvgStatus::Completed)
            .await
            .map_err(PipelineError::from)?;
        return Ok(());
    }

    let status = *lock.record().status;
    let allowed = if is_recovery {
        status.is_recoverable() || status.is_startable()
    } else {
        status.is_startable() || status.is_retryable()
    };
    if !allowed {
        tracing::warn!(version_id = svg_version_id.get(), %status, is_recovery, "not in a processable state");
        lock.commit().await.map_err(PipelineError::from)?;
        return Ok(());
    }

    let image_id = lock.record().image_id;
    let coloring_version_id = lock.record().coloring_version_id;
    let shape_stacking = lock.record().shape_stacking.clone();
    let group_by = lock.record().group_by.clone();
    let mut current_status = status;

    if matches!(current_status, SvgStatus::Pending | SvgStatus::Queued) {
        sqlx::query("UPDATE svg_versions SET status = $1, started_at = now() WHERE id = $2")
            .bind(SvgStatus::Processing.as_str())
            .bind(svg_version_id.get())
            .execute(lock.transaction_mut())
            .await
            .map_err(|e| PipelineError::Database(e.to_string()))?;
        current_status = SvgStatus::Processing;
    }
    lock.commit().await.map_err(PipelineError::from)?;

    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    let line_item = store::require_line_item(pool, image.line_item_id).await.map_err(PipelineError::from)?;
    let order_id = line_item.order_id;
    let coloring_version =
        store::require_coloring_version(pool, coloring_version_id).await.map_err(PipelineError::from)?;

    let Some(source_ref) = &coloring_version.file_ref else {
        mark_error(pool, dispatcher, order_id.get(), image_id.get(), svg_version_id).await;
        return Err(PipelineError::not_found(format!(
            "coloring version {coloring_version_id} has no uploaded file to vectorize"
        )));
    };

    publish_status(dispatcher, order_id.get(), image_id.get(), svg_version_id.get(), current_status).await;

    let Some(lock) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get()).await.map_err(PipelineError::from)?
    else {
        return Ok(());
    };
    if lock
        .verify_and_update_status(&[SvgStatus::Processing], SvgStatus::VectorizerProcessing)
        .await
        .is_err()
    {
        tracing::error!(version_id = svg_version_id.get(), "cannot start vectorizing");
        return Ok(());
    }
    publish_status(dispatcher, order_id.get(), image_id.get(), svg_version_id.get(), SvgStatus::VectorizerProcessing)
        .await;

    let source_bytes = external(
        pool, dispatcher, order_id.get(), image_id.get(), svg_version_id,
        store_.get(&source_ref.key),
    ).await?;
    let filename = format!("image_{}.png", image.position);
    let svg_bytes = match vectorizer.vectorize(&source_bytes, &filename, &shape_stacking, &group_by).await {
        Ok(bytes) => bytes,
        Err(e) => {
            mark_error(pool, dispatcher, order_id.get(), image_id.get(), svg_version_id).await;
            return Err(e.into());
        }
    };

    let Some(lock) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get()).await.map_err(PipelineError::from)?
    else {
        return Ok(());
    };
    if lock
        .verify_and_update_status(&[SvgStatus::VectorizerProcessing], SvgStatus::VectorizerCompleted)
        .await
        .is_err()
    {
        tracing::error!(version_id = svg_version_id.get(), "cannot mark VectorizerCompleted");
        return Ok(());
    }
    publish_status(dispatcher, order_id.get(), image_id.get(), svg_version_id.get(), SvgStatus::VectorizerCompleted)
        .await;

    let Some(lock) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get()).await.map_err(PipelineError::from)?
    else {
        return Ok(());
    };
    if lock
        .verify_and_update_status(&[SvgStatus::VectorizerCompleted], SvgStatus::StorageUpload)
        .await
        .is_err()
    {
        tracing::error!(version_id = svg_version_id.get(), "cannot start upload");
        return Ok(());
    }
    publish_status(dispatcher, order_id.get(), image_id.get(), svg_version_id.get(), SvgStatus::StorageUpload).await;

    let version = store::require_svg_version(pool, svg_version_id).await.map_err(PipelineError::from)?;
    let output_key = paths::svg_version(order_id.get(), line_item.position, image.position, version.version);
    let put = external(
        pool, dispatcher, order_id.get(), image_id.get(), svg_version_id,
        store_.put(&output_key, &svg_bytes, "image/svg+xml"),
    ).await?;

    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::version_status(
        order_id.get(),
        image_id.get(),
        svg_version_id.get(),
        StatusType::Svg,
        SvgStatus::Completed.as_str(),
    ));
    let current = sqlx::query_as::<_, SvgVersion>("SELECT * FROM svg_versions WHERE id = $1 FOR UPDATE")
        .bind(svg_version_id)
        .fetch_one(tracked.transaction_mut())
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    if !matches!(*current.status, SvgStatus::StorageUpload) {
        tracing::error!(version_id = svg_version_id.get(), "cannot mark Completed");
        return Ok(());
    }
    let file_ref = pf_core::FileRef {
        key: put.key,
        bucket: put.bucket,
        content_type: "image/svg+xml".to_string(),
        size: put.size,
        etag: put.etag,
        sha256: put.sha256,
        original_filename: None,
    };
    sqlx::query(
        "UPDATE svg_versions SET status = $1, file_ref = $2, external_job_id = NULL, completed_at = now() WHERE id = $3",
    )
    .bind(SvgStatus::Completed.as_str())
    .bind(&file_ref)
    .bind(svg_version_id.get())
    .execute(tracked.transaction_mut())
    .await
    .map_err(|e| PipelineError::Database(e.to_string()))?;
    store::set_image_selection(tracked.transaction_mut(), image_id, None, Some(svg_version_id))
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::SvgVersionStatus)?;
    tracked.mark_changed(TrackedField::ImageSelectedSvgId)?;
    tracked.commit(dispatcher).await?;

    tracing::info!(version_id = svg_version_id.get(), key = %output_key, "svg generation completed");
    Ok(())
}

async fn publish_status(dispatcher: &EventDispatcher, order_id: i64, image_id: i64, version_id: i64, status: SvgStatus) {
    dispatcher
        .publish(Event::ImageStatus {
            order_id,
            image_id,
            version_id,
            status_type: StatusType::Svg,
            status: status.as_str().to_string(),
        })
        .await;
}

async fn mark_error(pool: &PgPool, dispatcher: &EventDispatcher, order_id: i64, image_id: i64, svg_version_id: SvgVersionId) {
    let Ok(Some(lock)) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get()).await else { return };
    let current = *lock.record().status;
    if lock.verify_and_update_status(&[current], SvgStatus::Error).await.is_ok() {
        publish_status(dispatcher, order_id, image_id, svg_version_id.get(), SvgStatus::Error).await;
    }
}

/// Runs one piece of external work (source fetch, storage upload). On any
/// failure except a lost race (`UnexpectedStatus`), writes a best-effort
/// Error before propagating.
async fn external<T>(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    order_id: i64,
    image_id: i64,
    svg_version_id: SvgVersionId,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match fut.await {
        Ok(v) => Ok(v),
        Err(e) => {
            if !matches!(e, PipelineError::UnexpectedStatus { .. }) {
                mark_error(pool, dispatcher, order_id, image_id, svg_version_id).await;
            }
            Err(e)
        }
    }
}

/// Starts a new SvgVersion built from `coloring_version_id` (must already
/// be Completed; selection decides which coloring
/// version feeds a new SVG build, this function just materializes the row).
pub async fn create_svg_version(
    pool: &PgPool,
    image_id: ImageId,
    coloring_version_id: pf_core::ids::ColoringVersionId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<SvgVersionId> {
    let mut tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let shape_stacking = shape_stacking.to_string();
    let group_by = group_by.to_string();
    let version = pf_db::alloc::next_svg_version(&mut tx, image_id.get(), move |candidate, savepoint| {
        let shape_stacking = shape_stacking.clone();
        let group_by = group_by.clone();
        Box::pin(async move {
            store::insert_svg_version_at(
                &mut *savepoint,
                image_id,
                candidate,
                coloring_version_id,
                &shape_stacking,
                &group_by,
            )
            .await
            .map_err(DbError::into_sqlx)
        })
    })
    .await
    .map_err(PipelineError::from)?;
    tx.commit().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    Ok(version.id)
}

/// Resets an svg version stuck in Error back to Queued so it can be
/// picked up again. Caller re-enqueues the task afterward.
pub async fn retry_svg_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    svg_version_id: SvgVersionId,
) -> Result<()> {
    let Some(lock) = Lock::<SvgVersion>::acquire(pool, svg_version_id.get()).await.map_err(PipelineError::from)?
    else {
        return Err(PipelineError::not_found(format!("svg version {svg_version_id}")));
    };
    let current = *lock.record().status;
    if !current.is_retryable() {
        return Err(PipelineError::VersionNotInErrorState {
            version_id: svg_version_id.get(),
            actual: current.as_str().to_string(),
        });
    }
    let image_id = lock.record().image_id;

    sqlx::query("UPDATE svg_versions SET status = $1, external_job_id = NULL WHERE id = $2")
        .bind(SvgStatus::Queued.as_str())
        .bind(svg_version_id.get())
        .execute(lock.transaction_mut())
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    lock.commit().await.map_err(PipelineError::from)?;

    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    let line_item = store::require_line_item(pool, image.line_item_id).await.map_err(PipelineError::from)?;
    publish_status(dispatcher, line_item.order_id.get(), image_id.get(), svg_version_id.get(), SvgStatus::Queued).await;

    tracing::info!(version_id = svg_version_id.get(), "svg version prepared for retry");
    Ok(())
}
