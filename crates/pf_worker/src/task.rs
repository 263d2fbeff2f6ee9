//! Task row (C7): an (actor, payload) pair plus its retry bookkeeping.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    /// Terminal failure: either a `throws`-matched permanent error, or the
    /// retry budget was exhausted.
    DeadLetter,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: i64,
    pub actor: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub max_retries: i32,
    pub min_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
