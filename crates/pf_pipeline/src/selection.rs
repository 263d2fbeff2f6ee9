//! Selection: which coloring/SVG version an image's public
//! view points at. A new version is auto-selected the moment it's created;
//! a user can override that with an explicit Completed version; SVG
//! generation falls back to the latest Completed coloring when nothing is
//! explicitly selected or the explicit pick isn't usable yet.

use sqlx::PgPool;

use pf_core::ids::{ColoringVersionId, ImageId, OrderId, SvgVersionId};
use pf_core::{ColoringStatus, PipelineError, Result, SvgStatus};
use pf_db::models::ColoringVersion;
use pf_db::store;
use pf_events::{EventContext, EventDispatcher, TrackedField, TrackedTx};

use crate::coloring;
use crate::vectorize;

/// Selection precondition failures: permanent,
/// never worth a task-runtime retry.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("coloring version {0} is not Completed")]
    VersionNotCompleted(i64),
    #[error("version {0} does not belong to image {1}")]
    VersionOwnershipError(i64, i64),
    #[error("image {0} has no completed coloring version available")]
    NoColoringAvailable(i64),
    #[error("order {0} has no images eligible for this operation")]
    NoEligibleImages(i64),
}

impl From<SelectionError> for PipelineError {
    fn from(e: SelectionError) -> Self {
        PipelineError::Validation(e.to_string())
    }
}

/// Creates a new ColoringVersion and immediately makes it the image's
/// selection; the newest version always wins, regardless of status,
/// until a user (or a later version) overrides it.
pub async fn create_and_select_coloring_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    megapixels: f64,
    steps: i32,
) -> Result<ColoringVersionId> {
    let version_id = coloring::create_versions_for_image(pool, image_id, megapixels, steps)
        .await?
        .ok_or_else(|| PipelineError::Validation("image is not eligible for a new coloring version".into()))?;
    auto_select_coloring(pool, dispatcher, image_id, version_id).await?;
    Ok(version_id)
}

/// Creates a new SvgVersion from `coloring_version_id` and immediately
/// makes it the image's selection.
pub async fn create_and_select_svg_version(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    coloring_version_id: ColoringVersionId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<SvgVersionId> {
    let version_id =
        vectorize::create_svg_version(pool, image_id, coloring_version_id, shape_stacking, group_by).await?;
    auto_select_svg(pool, dispatcher, image_id, version_id).await?;
    Ok(version_id)
}

/// Creates and selects a ColoringVersion for every eligible image on an
/// order (no Completed version, none already in flight).
pub async fn create_and_select_coloring_versions_for_order(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    order_id: OrderId,
    megapixels: f64,
    steps: i32,
) -> Result<Vec<ColoringVersionId>> {
    let images = store::images_eligible_for_coloring(pool, order_id).await.map_err(PipelineError::from)?;
    if images.is_empty() {
        return Err(SelectionError::NoEligibleImages(order_id.get()).into());
    }
    let mut version_ids = Vec::with_capacity(images.len());
    for image in images {
        let version_id = create_and_select_coloring_version(pool, dispatcher, image.id, megapixels, steps).await?;
        version_ids.push(version_id);
    }
    Ok(version_ids)
}

/// Creates and selects an SvgVersion, sourced from each image's latest
/// Completed coloring, for every eligible image on an order (coloring
/// already Completed, no svg Completed or in flight).
pub async fn create_and_select_svg_versions_for_order(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    order_id: OrderId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<Vec<SvgVersionId>> {
    let images = store::images_eligible_for_svg(pool, order_id).await.map_err(PipelineError::from)?;
    if images.is_empty() {
        return Err(SelectionError::NoEligibleImages(order_id.get()).into());
    }
    let mut version_ids = Vec::with_capacity(images.len());
    for (image, coloring_version_id) in images {
        let version_id =
            create_and_select_svg_version(pool, dispatcher, image.id, coloring_version_id, shape_stacking, group_by)
                .await?;
        version_ids.push(version_id);
    }
    Ok(version_ids)
}

async fn auto_select_coloring(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    coloring_version_id: ColoringVersionId,
) -> Result<()> {
    let order_id = order_id_for_image(pool, image_id).await?;
    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::image(order_id, image_id.get()));
    store::set_image_selection(tracked.transaction_mut(), image_id, Some(coloring_version_id), None)
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::ImageSelectedColoringId)?;
    tracked.commit(dispatcher).await
}

async fn auto_select_svg(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    svg_version_id: SvgVersionId,
) -> Result<()> {
    let order_id = order_id_for_image(pool, image_id).await?;
    let tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::image(order_id, image_id.get()));
    store::set_image_selection(tracked.transaction_mut(), image_id, None, Some(svg_version_id))
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::ImageSelectedSvgId)?;
    tracked.commit(dispatcher).await
}

async fn order_id_for_image(pool: &PgPool, image_id: ImageId) -> Result<i64> {
    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    let line_item = store::require_line_item(pool, image.line_item_id).await.map_err(PipelineError::from)?;
    Ok(line_item.order_id.get())
}

/// Manual selection (`PUT /images/{id}/select`): only a
/// Completed version owned by `image_id` may be chosen. Two concurrent
/// calls both succeed; the image row's `FOR UPDATE` lock just serializes
/// them, and the last writer's version becomes the final selection (spec
/// scenario S3: no invariant is violated by either outcome).
pub async fn select_coloring(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    coloring_version_id: ColoringVersionId,
) -> Result<()> {
    let version =
        store::require_coloring_version(pool, coloring_version_id).await.map_err(PipelineError::from)?;
    if version.image_id != image_id {
        return Err(SelectionError::VersionOwnershipError(coloring_version_id.get(), image_id.get()).into());
    }
    if !matches!(*version.status, ColoringStatus::Completed) {
        return Err(SelectionError::VersionNotCompleted(coloring_version_id.get()).into());
    }

    let order_id = order_id_for_image(pool, image_id).await?;
    let mut tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    sqlx::query("SELECT id FROM images WHERE id = $1 FOR UPDATE")
        .bind(image_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::image(order_id, image_id.get()));
    store::set_image_selection(tracked.transaction_mut(), image_id, Some(coloring_version_id), None)
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::ImageSelectedColoringId)?;
    tracked.commit(dispatcher).await
}

pub async fn select_svg(
    pool: &PgPool,
    dispatcher: &EventDispatcher,
    image_id: ImageId,
    svg_version_id: SvgVersionId,
) -> Result<()> {
    let version = store::require_svg_version(pool, svg_version_id).await.map_err(PipelineError::from)?;
    if version.image_id != image_id {
        return Err(SelectionError::VersionOwnershipError(svg_version_id.get(), image_id.get()).into());
    }
    if !matches!(*version.status, SvgStatus::Completed) {
        return Err(SelectionError::VersionNotCompleted(svg_version_id.get()).into());
    }

    let order_id = order_id_for_image(pool, image_id).await?;
    let mut tx = pool.begin().await.map_err(|e| PipelineError::Database(e.to_string()))?;
    sqlx::query("SELECT id FROM images WHERE id = $1 FOR UPDATE")
        .bind(image_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| PipelineError::Database(e.to_string()))?;
    let mut tracked = TrackedTx::new(tx);
    tracked.set_mercure_context(EventContext::image(order_id, image_id.get()));
    store::set_image_selection(tracked.transaction_mut(), image_id, None, Some(svg_version_id))
        .await
        .map_err(PipelineError::from)?;
    tracked.mark_changed(TrackedField::ImageSelectedSvgId)?;
    tracked.commit(dispatcher).await
}

/// The coloring version an SVG build should source from: the image's
/// explicit selection if it's Completed, else the highest-version
/// Completed coloring, else `NoColoringAvailable`.
pub async fn resolve_coloring_source_for_svg(pool: &PgPool, image_id: ImageId) -> Result<ColoringVersion> {
    let image = store::require_image(pool, image_id).await.map_err(PipelineError::from)?;
    if let Some(selected_id) = image.selected_coloring_id {
        let version = store::require_coloring_version(pool, selected_id).await.map_err(PipelineError::from)?;
        if matches!(*version.status, ColoringStatus::Completed) {
            return Ok(version);
        }
    }
    store::latest_completed_coloring(pool, image_id)
        .await
        .map_err(PipelineError::from)?
        .ok_or_else(|| SelectionError::NoColoringAvailable(image_id.get()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_errors_translate_to_permanent_pipeline_errors() {
        let e: PipelineError = SelectionError::VersionNotCompleted(7).into();
        assert!(e.is_permanent());
    }
}
