//! Auto-increment allocator (C6): race-safe `next value` allocation for a
//! `(parent, counter column)` pair guarded by a named unique constraint.
//!
//! Ported from `AutoIncrementOnConflict` (`models/utils/auto_increment.py`),
//! which retries inside a SQLAlchemy savepoint on a matching
//! `IntegrityError`. sqlx's nested `Transaction::begin()` opens a real
//! `SAVEPOINT`, so the shape carries over directly: compute the candidate
//! value, open a savepoint, attempt the insert, and on a unique-violation
//! for the *named* constraint, roll back to the savepoint and retry with a
//! freshly computed value.

use sqlx::{Postgres, Transaction};
use std::future::Future;

use crate::error::{DbError, Result};

const DEFAULT_MAX_RETRIES: u32 = 5;

/// Runs `try_insert` in a retry loop, recomputing `next_value_sql` before
/// each attempt and opening a fresh savepoint per attempt. `try_insert`
/// receives the candidate value and a transaction scoped to that savepoint;
/// returning `Err` from a row-level unique-violation on `constraint_name`
/// triggers a retry, anything else propagates immediately.
pub async fn allocate_next<'c, F, Fut, R>(
    tx: &mut Transaction<'c, Postgres>,
    next_value_sql: &str,
    filter: i64,
    constraint_name: &str,
    mut try_insert: F,
) -> Result<R>
where
    F: FnMut(i32, &mut Transaction<'_, Postgres>) -> Fut,
    Fut: Future<Output = std::result::Result<R, sqlx::Error>>,
{
    for attempt in 1..=DEFAULT_MAX_RETRIES {
        let value: i32 = sqlx::query_scalar(next_value_sql)
            .bind(filter)
            .fetch_one(&mut **tx)
            .await?;

        let mut savepoint = tx.begin().await?;
        match try_insert(value, &mut savepoint).await {
            Ok(result) => {
                savepoint.commit().await?;
                return Ok(result);
            }
            Err(e) => {
                let db_err = DbError::from(e);
                let _ = savepoint.rollback().await;
                if db_err.is_unique_violation(constraint_name) {
                    tracing::warn!(attempt, constraint_name, "allocator retrying after conflict");
                    continue;
                }
                return Err(db_err);
            }
        }
    }
    Err(DbError::AllocationExhausted(DEFAULT_MAX_RETRIES))
}

/// Allocates the next 1-based `position` for a LineItem under `order_id`.
pub async fn next_line_item_position<'c>(
    tx: &mut Transaction<'c, Postgres>,
    order_id: i64,
    insert: impl FnMut(i32, &mut Transaction<'_, Postgres>) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<crate::models::LineItem, sqlx::Error>> + Send + '_>>,
) -> Result<crate::models::LineItem> {
    allocate_next(
        tx,
        "SELECT COALESCE(MAX(position), 0) + 1 FROM line_items WHERE order_id = $1",
        order_id,
        "uq_line_item_position",
        insert,
    )
    .await
}

/// Allocates the next `version` for a ColoringVersion under `image_id`.
pub async fn next_coloring_version<'c>(
    tx: &mut Transaction<'c, Postgres>,
    image_id: i64,
    insert: impl FnMut(i32, &mut Transaction<'_, Postgres>) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<crate::models::ColoringVersion, sqlx::Error>> + Send + '_>>,
) -> Result<crate::models::ColoringVersion> {
    allocate_next(
        tx,
        "SELECT COALESCE(MAX(version), 0) + 1 FROM coloring_versions WHERE image_id = $1",
        image_id,
        "uq_coloring_version_image_version",
        insert,
    )
    .await
}

/// Allocates the next `version` for an SvgVersion under `image_id`.
pub async fn next_svg_version<'c>(
    tx: &mut Transaction<'c, Postgres>,
    image_id: i64,
    insert: impl FnMut(i32, &mut Transaction<'_, Postgres>) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<crate::models::SvgVersion, sqlx::Error>> + Send + '_>>,
) -> Result<crate::models::SvgVersion> {
    allocate_next(
        tx,
        "SELECT COALESCE(MAX(version), 0) + 1 FROM svg_versions WHERE image_id = $1",
        image_id,
        "uq_svg_version_image_version",
        insert,
    )
    .await
}
