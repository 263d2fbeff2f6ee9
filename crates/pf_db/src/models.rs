//! Entity store row types (C2).
//!
//! Ported from SQLModel classes to `sqlx::FromRow` structs, the same
//! translation `casparian_sentinel/src/db/models.rs` performs for its own
//! tables.

use chrono::{DateTime, Utc};
use pf_core::ids::{ColoringVersionId, ImageId, LineItemId, OrderId, SvgVersionId};
use pf_core::{ColoringStatus, FileRef, OrderStatus, SvgStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub shopify_id: i64,
    pub order_number: String,
    /// Always stored with a leading `#`; normalized at the ingest write
    /// boundary (an open question, resolved in DESIGN.md).
    pub shopify_order_number: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub payment_status: Option<String>,
    pub shipping_method: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: OrderStatusColumn,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub order_id: OrderId,
    pub upstream_line_item_id: i64,
    pub position: i32,
    pub title: String,
    pub quantity: i32,
    pub dedication: Option<String>,
    pub layout_tag: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub line_item_id: LineItemId,
    pub position: i32,
    pub source_url: String,
    pub file_ref: Option<FileRef>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub selected_coloring_id: Option<ColoringVersionId>,
    pub selected_svg_id: Option<SvgVersionId>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ColoringVersion {
    pub id: ColoringVersionId,
    pub image_id: ImageId,
    pub version: i32,
    pub file_ref: Option<FileRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_job_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ColoringStatusColumn,
    pub megapixels: f64,
    pub steps: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SvgVersion {
    pub id: SvgVersionId,
    pub image_id: ImageId,
    pub version: i32,
    pub file_ref: Option<FileRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_job_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SvgStatusColumn,
    pub coloring_version_id: ColoringVersionId,
    pub shape_stacking: String,
    pub group_by: String,
}

// `ColoringStatus`/`SvgStatus`/`OrderStatus` live in pf_core (no sqlx
// dependency on the enum itself); thin wrapper newtypes carry the
// `TryFrom<String>` used by `#[sqlx(try_from = "String")]` above, and
// `Deref` to the plain enum everywhere else so callers rarely see them.
macro_rules! status_column {
    ($wrapper:ident, $inner:ty, $parse_err:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $wrapper(pub $inner);

        impl std::ops::Deref for $wrapper {
            type Target = $inner;
            fn deref(&self) -> &$inner {
                &self.0
            }
        }

        impl From<$inner> for $wrapper {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }

        impl TryFrom<String> for $wrapper {
            type Error = String;
            fn try_from(value: String) -> Result<Self, Self::Error> {
                use pf_core::ProcessingStatus;
                <$inner>::all()
                    .iter()
                    .find(|s| s.as_str() == value)
                    .copied()
                    .map($wrapper)
                    .ok_or_else(|| format!(concat!($parse_err, ": {}"), value))
            }
        }

        impl std::fmt::Display for $wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

status_column!(OrderStatusColumn, OrderStatus, "unknown order status");
status_column!(ColoringStatusColumn, ColoringStatus, "unknown coloring status");
status_column!(SvgStatusColumn, SvgStatus, "unknown svg status");
