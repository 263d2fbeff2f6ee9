//! Error types for the database layer (grounded on `casparian_db/src/error.rs`).

use pf_core::PipelineError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("row locked by another worker")]
    Locked,

    #[error("unexpected status: expected one of {expected:?}, found {actual}")]
    UnexpectedStatus { expected: Vec<String>, actual: String },

    #[error("auto-increment allocation exhausted after {0} attempts")]
    AllocationExhausted(u32),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// `true` when this is a Postgres lock-not-available error raised by
    /// `SELECT ... FOR UPDATE NOWAIT` (SQLSTATE `55P03`).
    pub fn is_lock_not_available(&self) -> bool {
        matches!(self, DbError::Sqlx(sqlx::Error::Database(e)) if e.code().as_deref() == Some("55P03"))
    }

    /// `true` when this is a unique-violation on the named constraint
    /// (SQLSTATE `23505`), the signal `AutoIncrementOnConflict` retries on.
    pub fn is_unique_violation(&self, constraint_name: &str) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Database(e)) => {
                e.code().as_deref() == Some("23505")
                    && e.constraint().map(|c| c == constraint_name).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Unwraps back to the underlying `sqlx::Error` where there is one,
    /// otherwise wraps the message in `sqlx::Error::Protocol`. Lets a
    /// `store` insert function be reused directly as an `allocate_next`
    /// try-insert closure, which must report failures as `sqlx::Error` so
    /// the allocator can inspect the unique-violation constraint name.
    pub fn into_sqlx(self) -> sqlx::Error {
        match self {
            DbError::Sqlx(e) => e,
            other => sqlx::Error::Protocol(other.to_string()),
        }
    }
}

impl From<DbError> for PipelineError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(msg) => PipelineError::NotFound(msg),
            DbError::Locked => PipelineError::Locked,
            DbError::UnexpectedStatus { expected, actual } => {
                PipelineError::UnexpectedStatus { expected, actual }
            }
            other => PipelineError::Database(other.to_string()),
        }
    }
}
