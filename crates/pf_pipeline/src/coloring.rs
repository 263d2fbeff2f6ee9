//! Coloring generation (C9): the RunPod-style diffusion state
//! machine. Five short record locks bracket the transitions; every
//! external call (image fetch, job submission, polling, upload) happens
//! outside a lock, per the source system's `ColoringGenerationService`.

use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use sqlx::PgPool;

use pf_core::ids::{ColoringVersionId, ImageId};
use pf_core::{ColoringStatus, PipelineError, ProcessingStatus, Result};
use pf_db::error::DbError;
use pf_db::lock::Lock;
use pf_db::models::ColoringVersion;
use pf_db::store;
use pf_events::{Event, EventContext, EventDispatcher, StatusType, TrackedField, TrackedTx};

use crate::paths;
use crate::ports::{DiffusionClient, DiffusionOutcome, ObjectStore, StatusSink};

/// Upscales `bytes` so its longer side is at least `min_size` pixels,
/// re-encoding as PNG. Ported from `runpod.py`'s `_ensure_min_resolution`
/// (PIL `LANCZOS`); `image`'s `Lanczos3` filter is the equivalent kernel.
pub fn ensure_min_resolution(bytes: &[u8], min_size: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::Validation(format!("unreadable image: {e}")))?;
    let (w, h) = (img.width(), img.height());
    let longer = w.max(h);
    let resized = if longer >= min_size {
        img
    } else {
        let scale = f64::from(min_size) / f64::from(longer);
        let new_w = (f64::from(w) * scale).round() as u32;
        let new_h = (f64::from(h) * scale).round() as u32;
        img.resize(new_w, new_h, FilterType::Lanczos3)
    };
    let mut out = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| PipelineError::Validation(format!("failed to encode image: {e}")))?;
    Ok(out)
}

/// Entry point: drives `coloring_version_id` through as much of the state
/// machine as a single call can complete. Any precondition miss or lost
/// status race returns `Ok(())` silently; these are expected outcomes of
/// concurrent workers racing the same record, not actor failures. Any
/// other failure from the external calls (fetch, submit, poll, upload)
/// moves the record to Error before propagating, so it never sits stuck
/// in an awaiting-external state outside the recovery sweep's reach.
pub async fn process_coloring_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    store_: &dyn ObjectStore,
    diffusion: &dyn DiffusionClient,
    min_image_size: u32,
    poll_interval: Duration,
    poll_timeout: Duration,
    coloring_version_id: ColoringVersionId,
    is_recovery: bool,
) -> Result<()> {
    let Some(mut lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
        .await
        .map_err(PipelineError::from)?
    else {
        return Err(PipelineError::not_found(format!("coloring version {coloring_version_id}")));
    };

    if lock.record().file_ref.is_some() {
        let current = *lock.record().status;
        tracing::warn!(version_id = coloring_version_id.get(), "already has file_ref, marking completed");
        lock.verify_and_update_status(&[current], ColoringStatus::Completed)
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
        tracing::warn!(version_id = coloring_version_id.get(), %status, is_recovery, "not in a processable state");
        lock.commit().await.map_err(PipelineError::from)?;
        return Ok(());
    }

    let image_id = lock.record().image_id;
    let existing_job_id = lock.record().external_job_id.clone();
    let megapixels = lock.record().megapixels;
    let steps = lock.record().steps;
    let mut current_status = status;

    if matches!(current_status, ColoringStatus::Pending | ColoringStatus::Queued) {
        sqlx::query("UPDATE coloring_versions SET status = $1, started_at = now() WHERE id = $2")
            .bind(ColoringStatus::Processing.as_str())
            .bind(coloring_version_id.get())
            .execute(lock.transaction_mut())
            .await
            .map_err(|e| PipelineError::Database(e.to_string()))?;
        current_status = ColoringStatus::Processing;
    }
    lock.commit().await.map_err(PipelineError::from)?;

    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    let line_item = store::require_line_item(pool, image.line_item_id).await.map_err(PipelineError::from)?;
    let order_id = line_item.order_id;

    let Some(image_ref) = &image.file_ref else {
        mark_error(pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id).await;
        return Err(PipelineError::not_found(format!("image {image_id} has no uploaded source file")));
    };

    publish_status(dispatcher, order_id.get(), image_id.get(), coloring_version_id.get(), current_status).await;

    let job_id = if let Some(job_id) = existing_job_id {
        tracing::info!(version_id = coloring_version_id.get(), job_id, "resuming existing diffusion job");
        job_id
    } else {
        let source_bytes = external(
            pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id,
            store_.get(&image_ref.key),
        ).await?;
        let upscaled = external(
            pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id,
            std::future::ready(ensure_min_resolution(&source_bytes, min_image_size)),
        ).await?;

        let Some(mut lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
            .await
            .map_err(PipelineError::from)?
        else {
            return Ok(());
        };
        if lock.record().external_job_id.is_some() {
            tracing::info!(version_id = coloring_version_id.get(), "another worker already submitted");
            return Ok(());
        }
        sqlx::query("UPDATE coloring_versions SET status = $1 WHERE id = $2")
            .bind(ColoringStatus::RunpodSubmitting.as_str())
            .bind(coloring_version_id.get())
            .execute(lock.transaction_mut())
            .await
            .map_err(|e| PipelineError::Database(e.to_string()))?;
        lock.commit().await.map_err(PipelineError::from)?;
        publish_status(dispatcher, order_id.get(), image_id.get(), coloring_version_id.get(), ColoringStatus::RunpodSubmitting).await;

        let job_id = external(
            pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id,
            diffusion.submit_job(&upscaled, megapixels, steps as u32),
        ).await?;

        let Some(mut lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
            .await
            .map_err(PipelineError::from)?
        else {
            return Ok(());
        };
        sqlx::query("UPDATE coloring_versions SET external_job_id = $1, status = $2 WHERE id = $3")
            .bind(&job_id)
            .bind(ColoringStatus::RunpodSubmitted.as_str())
            .bind(coloring_version_id.get())
            .execute(lock.transaction_mut())
            .await
            .map_err(|e| PipelineError::Database(e.to_string()))?;
        lock.commit().await.map_err(PipelineError::from)?;
        publish_status(dispatcher, order_id.get(), image_id.get(), coloring_version_id.get(), ColoringStatus::RunpodSubmitted).await;
        job_id
    };

    let sink = PollSink {
        pool: pool.clone(),
        dispatcher,
        order_id: order_id.get(),
        image_id: image_id.get(),
        coloring_version_id,
    };
    let outcome = external(
        pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id,
        diffusion.poll_job(&job_id, poll_timeout, poll_interval, &sink),
    ).await?;

    let result_bytes = match outcome {
        DiffusionOutcome::Completed(bytes) => bytes,
        DiffusionOutcome::Failed(message) => {
            mark_error(pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id).await;
            return Err(PipelineError::Permanent(message));
        }
    };

    let Some(lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
        .await
        .map_err(PipelineError::from)?
    else {
        return Ok(());
    };
    let awaiting = ColoringStatus::awaiting_external_states();
    if lock.verify_and_update_status(awaiting, ColoringStatus::RunpodCompleted).await.is_err() {
        tracing::error!(version_id = coloring_version_id.get(), "cannot mark RunpodCompleted");
        return Ok(());
    }
    publish_status(dispatcher, order_id.get(), image_id.get(), coloring_version_id.get(), ColoringStatus::RunpodCompleted).await;

    let Some(lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
        .await
        .map_err(PipelineError::from)?
    else {
        return Ok(());
    };
    if lock
        .verify_and_update_status(&[ColoringStatus::RunpodCompleted], ColoringStatus::StorageUpload)
        .await
        .is_err()
    {
        tracing::error!(version_id = coloring_version_id.get(), "cannot start upload");
        return Ok(());
    }
    publish_status(dispatcher, order_id.get(), image_id.get(), coloring_version_id.get(), ColoringStatus::StorageUpload).await;

    let version = store::require_coloring_version(pool, coloring_version_id).await.map_err(PipelineError::from)?;
    let output_key = paths::coloring_version(order_id.get(), line_item.position, image.position, version.version);
    let put = external(
        pool, dispatcher, order_id.get(), image_id.get(), coloring_version_id,
        store_.put(&output_key, &result_bytes, "image/png"),
    ).await?;

    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::version_status(
        order_id.get(),
        image_id.get(),
        coloring_version_id.get(),
        StatusType::Coloring,
        ColoringStatus::Completed.as_str(),
    ));
    let current = sqlx::query_as::<_, ColoringVersion>("SELECT * FROM coloring_versions WHERE id = $1 FOR UPDATE")
        .bind(coloring_version_id)
        .fetch_one(tracked.transaction_mut())
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    if !matches!(*current.status, ColoringStatus::StorageUpload) {
        tracing::error!(version_id = coloring_version_id.get(), "cannot mark Completed");
        return Ok(());
    }
    let file_ref = pf_core::FileRef {
        key: put.key,
        bucket: put.bucket,
        content_type: "image/png".to_string(),
        size: put.size,
        etag: put.etag,
        sha256: put.sha256,
        original_filename: None,
    };
    sqlx::query(
        "UPDATE coloring_versions SET status = $1, file_ref = $2, external_job_id = NULL, completed_at = now() WHERE id = $3",
    )
    .bind(ColoringStatus::Completed.as_str())
    .bind(&file_ref)
    .bind(coloring_version_id.get())
    .execute(tracked.transaction_mut())
    .await
    .map_err(|e| PipelineError::Database(e.to_string()))?;
    store::set_image_selection(tracked.transaction_mut(), image_id, Some(coloring_version_id), None)
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::ColoringVersionStatus)?;
    tracked.mark_changed(TrackedField::ImageSelectedColoringId)?;
    tracked.commit(dispatcher).await?;

    tracing::info!(version_id = coloring_version_id.get(), key = %output_key, "coloring generation completed");
    Ok(())
}

struct PollSink<'a> {
    pool: PgPool,
    dispatcher: &'a EventDispatcher,
    order_id: i64,
    image_id: i64,
    coloring_version_id: ColoringVersionId,
}

#[async_trait]
impl<'a> StatusSink for PollSink<'a> {
    async fn on_status(&self, status: &str) {
        let new_status = match status {
            "IN_QUEUE" => ColoringStatus::RunpodQueued,
            "IN_PROGRESS" => ColoringStatus::RunpodProcessing,
            _ => return,
        };
        let Ok(Some(lock)) = Lock::<ColoringVersion>::acquire(&self.pool, self.coloring_version_id.get()).await else {
            return;
        };
        let current = *lock.record().status;
        if !ColoringStatus::awaiting_external_states().contains(&current) {
            tracing::warn!(version_id = self.coloring_version_id.get(), %current, "status changed unexpectedly during polling");
            return;
        }
        if lock.verify_and_update_status(&[current], new_status).await.is_ok() {
            publish_status(self.dispatcher, self.order_id, self.image_id, self.coloring_version_id.get(), new_status).await;
        }
    }
}

async fn publish_status(dispatcher: &EventDispatcher, order_id: i64, image_id: i64, version_id: i64, status: ColoringStatus) {
    dispatcher
        .publish(Event::ImageStatus {
            order_id,
            image_id,
            version_id,
            status_type: StatusType::Coloring,
            status: status.as_str().to_string(),
        })
        .await;
}

async fn mark_error(pool: &PgPool, dispatcher: &EventDispatcher, order_id: i64, image_id: i64, coloring_version_id: ColoringVersionId) {
    let Ok(Some(lock)) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get()).await else { return };
    let current = *lock.record().status;
    if lock.verify_and_update_status(&[current], ColoringStatus::Error).await.is_ok() {
        publish_status(dispatcher, order_id, image_id, coloring_version_id.get(), ColoringStatus::Error).await;
    }
}

/// Runs one piece of external work (image fetch, job submission, polling,
/// storage upload). On any failure except a lost race
/// (`UnexpectedStatus`, where another worker already moved the record on),
/// writes a best-effort Error before propagating, so a record never sits
/// stuck in an awaiting-external state that the non-recovery retry path
/// refuses to pick back up.
async fn external<T>(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    order_id: i64,
    image_id: i64,
    coloring_version_id: ColoringVersionId,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match fut.await {
        Ok(v) => Ok(v),
        Err(e) => {
            if !matches!(e, PipelineError::UnexpectedStatus { .. }) {
                mark_error(pool, dispatcher, order_id, image_id, coloring_version_id).await;
            }
            Err(e)
        }
    }
}

/// Allocates and inserts the next ColoringVersion row for one image.
/// Eligibility (is there already a Completed or in-flight version) is the
/// caller's concern; this always creates one.
pub async fn create_versions_for_image(
    pool: &PgPool,
    image_id: ImageId,
    megapixels: f64,
    steps: i32,
) -> Result<Option<ColoringVersionId>> {
    let mut tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let version = pf_db::alloc::next_coloring_version(&mut tx, image_id.get(), move |candidate, savepoint| {
        Box::pin(async move {
            store::insert_coloring_version_at(&mut *savepoint, image_id, candidate, megapixels, steps)
                .await
                .map_err(DbError::into_sqlx)
        })
    })
    .await
    .map_err(PipelineError::from)?;
    tx.commit().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    Ok(Some(version.id))
}

/// Resets a coloring version stuck in Error back to Queued so it can be
/// picked up again. Ported from `coloring_service.py`'s `prepare_retry`;
/// the caller is responsible for re-enqueuing the task afterward.
pub async fn retry_coloring_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    coloring_version_id: ColoringVersionId,
) -> Result<()> {
    let Some(lock) = Lock::<ColoringVersion>::acquire(pool, coloring_version_id.get())
        .await
        .map_err(PipelineError::from)?
    else {
        return Err(PipelineError::not_found(format!("coloring version {coloring_version_id}")));
    };
    let current = *lock.record().status;
    if !current.is_retryable() {
        return Err(PipelineError::VersionNotInErrorState {
            version_id: coloring_version_id.get(),
            actual: current.as_str().to_string(),
        });
    }
    let image_id = lock.record().image_id;

    sqlx::query("UPDATE coloring_versions SET status = $1, external_job_id = NULL WHERE id = $2")
        .bind(ColoringStatus::Queued.as_str())
        .bind(coloring_version_id.get())
        .execute(lock.transaction_mut())
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    lock.commit().await.map_err(PipelineError::from)?;

    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    let line_item = store::require_line_item(pool, image.line_item_id).await.map_err(PipelineError::from)?;
    publish_status(dispatcher, line_item.order_id.get(), image_id.get(), coloring_version_id.get(), ColoringStatus::Queued)
        .await;

    tracing::info!(version_id = coloring_version_id.get(), "coloring version prepared for retry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_image_is_upscaled_to_the_minimum_side() {
        let mut img = image::RgbImage::new(500, 800);
        for px in img.pixels_mut() {
            *px = image::Rgb([10, 20, 30]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let resized = ensure_min_resolution(&bytes, 1200).unwrap();
        let decoded = image::load_from_memory(&resized).unwrap();
        assert!(decoded.width().max(decoded.height()) >= 1200);
    }

    #[test]
    fn already_large_image_is_left_alone() {
        let img = image::RgbImage::new(1600, 1200);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let out = ensure_min_resolution(&bytes, 1200).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1600, 1200));
    }
}
