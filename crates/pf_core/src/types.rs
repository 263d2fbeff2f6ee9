//! Value types shared across the entity store and the pipeline services.

use serde::{Deserialize, Serialize};

/// A reference to an object in content-addressed storage.
/// Becomes non-null on a version row *iff* that version reached
/// `Completed`: see the self-healing invariant covered by recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub key: String,
    pub bucket: String,
    pub content_type: String,
    pub size: i64,
    pub etag: String,
    pub sha256: String,
    pub original_filename: Option<String>,
}

// Stored as a single JSONB column; delegates to sqlx's built-in `Json<T>`
// support so `pf_db`'s `FromRow` structs can hold a plain `Option<FileRef>`
// field instead of threading `sqlx::types::Json` through every call site.
#[cfg(feature = "sqlx")]
mod sqlx_json {
    use super::FileRef;
    use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
    use sqlx::types::Json;
    use sqlx::{Decode, Encode, Postgres, Type};

    impl Type<Postgres> for FileRef {
        fn type_info() -> PgTypeInfo {
            <Json<FileRef> as Type<Postgres>>::type_info()
        }
        fn compatible(ty: &PgTypeInfo) -> bool {
            <Json<FileRef> as Type<Postgres>>::compatible(ty)
        }
    }

    impl<'q> Encode<'q, Postgres> for FileRef {
        fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> sqlx::encode::IsNull {
            Json(self).encode_by_ref(buf)
        }
    }

    impl<'r> Decode<'r, Postgres> for FileRef {
        fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
            let Json(inner) = Json::<FileRef>::decode(value)?;
            Ok(inner)
        }
    }
}
