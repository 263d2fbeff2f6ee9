//! Error taxonomy shared by every pipeline crate.

use std::fmt;

/// Top-level pipeline error. Pipeline services translate transient I/O
/// failures into `Transient` (so the task runtime retries), translate
/// races into `Locked`/`UnexpectedStatus` (handled silently by the
/// service, never surfaced to the runtime), and translate permanent
/// external rejections into `Permanent` (marked `throws` so the runtime
/// does not retry).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("programming error: Mercure context missing required field(s): {0}")]
    ContextMissing(String),

    #[error("row locked by another worker")]
    Locked,

    #[error("unexpected status: expected one of {expected:?}, found {actual}")]
    UnexpectedStatus {
        expected: Vec<String>,
        actual: String,
    },

    #[error("version {version_id} is not in an error state (found {actual}), cannot retry")]
    VersionNotInErrorState {
        version_id: i64,
        actual: String,
    },

    #[error("external call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("permanent external failure: {0}")]
    Permanent(String),

    /// Carries the `Display` of whatever the database layer raised.
    /// `pf_core` does not depend on `sqlx`; `pf_db::DbError` converts into
    /// this variant at the crate boundary instead.
    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for errors a task actor should mark `throws` (never retried
    /// by the task runtime): permanent external rejections and
    /// validation errors raised before any external call was made.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PipelineError::Permanent(_) | PipelineError::Validation(_) | PipelineError::VersionNotInErrorState { .. }
        )
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn context_missing(fields: &[&str]) -> Self {
        Self::ContextMissing(fields.join(", "))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
