//! Entity store (C2): plain CRUD and lookup queries over the five tables.
//!
//! No business logic lives here; the pipeline services own the
//! state machines. This module only knows how to read and insert rows.

use chrono::Utc;
use pf_core::ids::{ColoringVersionId, ImageId, LineItemId, OrderId, SvgVersionId};
use pf_core::{ColoringStatus, OrderStatus, ProcessingStatus, SvgStatus};
use sqlx::PgExecutor;

use crate::error::{DbError, Result};
use crate::models::{ColoringVersion, Image, LineItem, Order, SvgVersion};

pub async fn find_order_by_id<'e>(exec: impl PgExecutor<'e>, id: OrderId) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(order)
}

pub async fn find_order_by_shopify_id<'e>(
    exec: impl PgExecutor<'e>,
    shopify_id: i64,
) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE shopify_id = $1")
        .bind(shopify_id)
        .fetch_optional(exec)
        .await?;
    Ok(order)
}

pub async fn require_order<'e>(exec: impl PgExecutor<'e>, id: OrderId) -> Result<Order> {
    find_order_by_id(exec, id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("order {id}")))
}

/// Upserts a bare order row on first sight of an upstream order ID.
/// Ingest immediately overwrites the metadata fields after this.
pub async fn insert_order<'e>(
    exec: impl PgExecutor<'e>,
    shopify_id: i64,
    order_number: &str,
    shopify_order_number: &str,
) -> Result<Order> {
    let order = sqlx::query_as::<_, Order>(
        r#"
        INSERT INTO orders (shopify_id, order_number, shopify_order_number, status)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(shopify_id)
    .bind(order_number)
    .bind(shopify_order_number)
    .bind(OrderStatus::Pending.as_str())
    .fetch_one(exec)
    .await?;
    Ok(order)
}

pub async fn update_order_status<'e>(
    exec: impl PgExecutor<'e>,
    id: OrderId,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Recoverable Orders (Downloading, Processing); recovery's worklist for
/// the order-level actor (`get_incomplete`).
pub async fn incomplete_orders<'e>(exec: impl PgExecutor<'e>) -> Result<Vec<Order>> {
    let recoverable: Vec<&str> = OrderStatus::intermediate_states().iter().map(|s| s.as_str()).collect();
    let orders = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = ANY($1)")
        .bind(&recoverable[..])
        .fetch_all(exec)
        .await?;
    Ok(orders)
}

pub async fn update_order_metadata<'e>(
    exec: impl PgExecutor<'e>,
    id: OrderId,
    customer_email: Option<&str>,
    customer_name: Option<&str>,
    payment_status: Option<&str>,
    shipping_method: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE orders
        SET customer_email = $1, customer_name = $2, payment_status = $3,
            shipping_method = $4, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(customer_email)
    .bind(customer_name)
    .bind(payment_status)
    .bind(shipping_method)
    .bind(Utc::now())
    .bind(id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_line_item_by_upstream_id<'e>(
    exec: impl PgExecutor<'e>,
    order_id: OrderId,
    upstream_line_item_id: i64,
) -> Result<Option<LineItem>> {
    let item = sqlx::query_as::<_, LineItem>(
        "SELECT * FROM line_items WHERE order_id = $1 AND upstream_line_item_id = $2",
    )
    .bind(order_id)
    .bind(upstream_line_item_id)
    .fetch_optional(exec)
    .await?;
    Ok(item)
}

pub async fn list_line_items<'e>(exec: impl PgExecutor<'e>, order_id: OrderId) -> Result<Vec<LineItem>> {
    let items = sqlx::query_as::<_, LineItem>(
        "SELECT * FROM line_items WHERE order_id = $1 ORDER BY position",
    )
    .bind(order_id)
    .fetch_all(exec)
    .await?;
    Ok(items)
}

/// Inserts a LineItem at a caller-supplied `position`. Callers obtain that
/// position from the auto-increment allocator to stay race-safe.
pub async fn insert_line_item_at<'e>(
    exec: impl PgExecutor<'e>,
    order_id: OrderId,
    upstream_line_item_id: i64,
    position: i32,
    title: &str,
    quantity: i32,
    dedication: Option<&str>,
    layout_tag: Option<&str>,
) -> Result<LineItem> {
    let item = sqlx::query_as::<_, LineItem>(
        r#"
        INSERT INTO line_items
            (order_id, upstream_line_item_id, position, title, quantity, dedication, layout_tag)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(upstream_line_item_id)
    .bind(position)
    .bind(title)
    .bind(quantity)
    .bind(dedication)
    .bind(layout_tag)
    .fetch_one(exec)
    .await?;
    Ok(item)
}

pub async fn find_line_item_by_id<'e>(exec: impl PgExecutor<'e>, id: LineItemId) -> Result<Option<LineItem>> {
    let item = sqlx::query_as::<_, LineItem>("SELECT * FROM line_items WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(item)
}

pub async fn require_line_item<'e>(exec: impl PgExecutor<'e>, id: LineItemId) -> Result<LineItem> {
    find_line_item_by_id(exec, id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("line item {id}")))
}

pub async fn find_image_by_position<'e>(
    exec: impl PgExecutor<'e>,
    line_item_id: LineItemId,
    position: i32,
) -> Result<Option<Image>> {
    let image = sqlx::query_as::<_, Image>(
        "SELECT * FROM images WHERE line_item_id = $1 AND position = $2",
    )
    .bind(line_item_id)
    .bind(position)
    .fetch_optional(exec)
    .await?;
    Ok(image)
}

pub async fn find_image_by_id<'e>(exec: impl PgExecutor<'e>, id: ImageId) -> Result<Option<Image>> {
    let image = sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(image)
}

pub async fn require_image<'e>(exec: impl PgExecutor<'e>, id: ImageId) -> Result<Image> {
    find_image_by_id(exec, id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("image {id}")))
}

pub async fn insert_image<'e>(
    exec: impl PgExecutor<'e>,
    line_item_id: LineItemId,
    position: i32,
    source_url: &str,
) -> Result<Image> {
    let image = sqlx::query_as::<_, Image>(
        r#"
        INSERT INTO images (line_item_id, position, source_url)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(line_item_id)
    .bind(position)
    .bind(source_url)
    .fetch_one(exec)
    .await?;
    Ok(image)
}

/// Images with a null `file_ref`, across the whole order; the download
/// service's worklist.
pub async fn images_pending_download<'e>(
    exec: impl PgExecutor<'e>,
    order_id: OrderId,
) -> Result<Vec<Image>> {
    let images = sqlx::query_as::<_, Image>(
        r#"
        SELECT images.* FROM images
        JOIN line_items ON line_items.id = images.line_item_id
        WHERE line_items.order_id = $1 AND images.file_ref IS NULL
        "#,
    )
    .bind(order_id)
    .fetch_all(exec)
    .await?;
    Ok(images)
}

/// Images with a source file and no Completed or in-flight coloring
/// version; the order-level fan-out's worklist ("all eligible images").
pub async fn images_eligible_for_coloring<'e>(
    exec: impl PgExecutor<'e>,
    order_id: OrderId,
) -> Result<Vec<Image>> {
    let mut blocking: Vec<&str> = vec![ColoringStatus::Completed.as_str()];
    blocking.extend(ColoringStatus::intermediate_states().iter().map(|s| s.as_str()));
    let images = sqlx::query_as::<_, Image>(
        r#"
        SELECT images.* FROM images
        JOIN line_items ON line_items.id = images.line_item_id
        WHERE line_items.order_id = $1
          AND images.file_ref IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM coloring_versions
              WHERE coloring_versions.image_id = images.id
                AND coloring_versions.status = ANY($2)
          )
        ORDER BY images.id
        "#,
    )
    .bind(order_id)
    .bind(&blocking[..])
    .fetch_all(exec)
    .await?;
    Ok(images)
}

/// Images with a Completed coloring version and no Completed or
/// in-flight SVG version; the order-level SVG fan-out's worklist.
pub async fn images_eligible_for_svg<'e>(
    exec: impl PgExecutor<'e>,
    order_id: OrderId,
) -> Result<Vec<(Image, ColoringVersionId)>> {
    use sqlx::{FromRow, Row};

    let mut blocking: Vec<&str> = vec![SvgStatus::Completed.as_str()];
    blocking.extend(SvgStatus::intermediate_states().iter().map(|s| s.as_str()));
    let rows = sqlx::query(
        r#"
        SELECT images.*, latest.id AS "coloring_version_id"
        FROM images
        JOIN line_items ON line_items.id = images.line_item_id
        JOIN LATERAL (
            SELECT id FROM coloring_versions
            WHERE coloring_versions.image_id = images.id AND coloring_versions.status = $3
            ORDER BY version DESC
            LIMIT 1
        ) latest ON true
        WHERE line_items.order_id = $1
          AND NOT EXISTS (
              SELECT 1 FROM svg_versions
              WHERE svg_versions.image_id = images.id
                AND svg_versions.status = ANY($2)
          )
        ORDER BY images.id
        "#,
    )
    .bind(order_id)
    .bind(&blocking[..])
    .bind(ColoringStatus::Completed.as_str())
    .fetch_all(exec)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let image = Image::from_row(row)?;
        let coloring_version_id: i64 = row.try_get("coloring_version_id")?;
        out.push((image, ColoringVersionId::new(coloring_version_id)));
    }
    Ok(out)
}

pub async fn set_image_selection<'e>(
    exec: impl PgExecutor<'e>,
    image_id: ImageId,
    selected_coloring_id: Option<ColoringVersionId>,
    selected_svg_id: Option<SvgVersionId>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE images
        SET selected_coloring_id = COALESCE($1, selected_coloring_id),
            selected_svg_id = COALESCE($2, selected_svg_id)
        WHERE id = $3
        "#,
    )
    .bind(selected_coloring_id)
    .bind(selected_svg_id)
    .bind(image_id)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_coloring_version<'e>(
    exec: impl PgExecutor<'e>,
    id: ColoringVersionId,
) -> Result<Option<ColoringVersion>> {
    let v = sqlx::query_as::<_, ColoringVersion>("SELECT * FROM coloring_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(v)
}

pub async fn require_coloring_version<'e>(
    exec: impl PgExecutor<'e>,
    id: ColoringVersionId,
) -> Result<ColoringVersion> {
    find_coloring_version(exec, id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("coloring version {id}")))
}

/// The highest-`version` Completed coloring for an image; the fallback
/// used by the SVG selection rule when no explicit selection, or
/// a non-completed selection, is usable.
pub async fn latest_completed_coloring<'e>(
    exec: impl PgExecutor<'e>,
    image_id: ImageId,
) -> Result<Option<ColoringVersion>> {
    let v = sqlx::query_as::<_, ColoringVersion>(
        r#"
        SELECT * FROM coloring_versions
        WHERE image_id = $1 AND status = $2
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(image_id)
    .bind(ColoringStatus::Completed.as_str())
    .fetch_optional(exec)
    .await?;
    Ok(v)
}

pub async fn insert_coloring_version_at<'e>(
    exec: impl PgExecutor<'e>,
    image_id: ImageId,
    version: i32,
    megapixels: f64,
    steps: i32,
) -> Result<ColoringVersion> {
    let v = sqlx::query_as::<_, ColoringVersion>(
        r#"
        INSERT INTO coloring_versions (image_id, version, status, megapixels, steps)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(image_id)
    .bind(version)
    .bind(ColoringStatus::Pending.as_str())
    .bind(megapixels)
    .bind(steps)
    .fetch_one(exec)
    .await?;
    Ok(v)
}

/// Recoverable ColoringVersions with no `file_ref`; recovery's worklist
/// for this actor (`get_incomplete`).
pub async fn incomplete_coloring_versions<'e>(exec: impl PgExecutor<'e>) -> Result<Vec<ColoringVersion>> {
    let recoverable: Vec<&str> = ColoringStatus::intermediate_states()
        .iter()
        .map(|s| s.as_str())
        .collect();
    let v = sqlx::query_as::<_, ColoringVersion>(
        "SELECT * FROM coloring_versions WHERE file_ref IS NULL AND status = ANY($1)",
    )
    .bind(&recoverable[..])
    .fetch_all(exec)
    .await?;
    Ok(v)
}

pub async fn find_svg_version<'e>(
    exec: impl PgExecutor<'e>,
    id: SvgVersionId,
) -> Result<Option<SvgVersion>> {
    let v = sqlx::query_as::<_, SvgVersion>("SELECT * FROM svg_versions WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(v)
}

pub async fn require_svg_version<'e>(exec: impl PgExecutor<'e>, id: SvgVersionId) -> Result<SvgVersion> {
    find_svg_version(exec, id)
        .await?
        .ok_or_else(|| DbError::not_found(format!("svg version {id}")))
}

pub async fn insert_svg_version_at<'e>(
    exec: impl PgExecutor<'e>,
    image_id: ImageId,
    version: i32,
    coloring_version_id: ColoringVersionId,
    shape_stacking: &str,
    group_by: &str,
) -> Result<SvgVersion> {
    let v = sqlx::query_as::<_, SvgVersion>(
        r#"
        INSERT INTO svg_versions
            (image_id, version, status, coloring_version_id, shape_stacking, group_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(image_id)
    .bind(version)
    .bind(SvgStatus::Pending.as_str())
    .bind(coloring_version_id)
    .bind(shape_stacking)
    .bind(group_by)
    .fetch_one(exec)
    .await?;
    Ok(v)
}

pub async fn incomplete_svg_versions<'e>(exec: impl PgExecutor<'e>) -> Result<Vec<SvgVersion>> {
    let recoverable: Vec<&str> = SvgStatus::intermediate_states().iter().map(|s| s.as_str()).collect();
    let v = sqlx::query_as::<_, SvgVersion>(
        "SELECT * FROM svg_versions WHERE file_ref IS NULL AND status = ANY($1)",
    )
    .bind(&recoverable[..])
    .fetch_all(exec)
    .await?;
    Ok(v)
}
