//! Atomic claim queue (C7). Grounded on `casparian_sentinel/src/db/queue.rs`'s
//! `UPDATE ... WHERE status = 'QUEUED'` claim, generalized from one fixed
//! table shape to an arbitrary JSONB payload per actor, and tightened from
//! select-then-conditional-update to a single `FOR UPDATE SKIP LOCKED`
//! statement so concurrent claimers never observe each other's candidate row.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::error::{Result, WorkerError};
use crate::task::{Task, TaskStatus};

pub async fn enqueue(
    pool: &PgPool,
    actor: &str,
    payload: Value,
    max_retries: u32,
    min_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (actor, payload, max_retries, min_backoff_ms, max_backoff_ms)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(actor)
    .bind(payload)
    .bind(max_retries as i32)
    .bind(min_backoff.as_millis() as i64)
    .bind(max_backoff.as_millis() as i64)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Atomically claims one runnable task for any actor name in `actors`, or
/// `None` if nothing is due. `SKIP LOCKED` means a crashed claimer holding
/// a stale row lock never blocks other workers.
pub async fn claim(pool: &PgPool, actors: &[&str]) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        r#"
        UPDATE tasks
        SET status = 'running', attempts = attempts + 1, updated_at = now()
        WHERE id = (
            SELECT id FROM tasks
            WHERE status = 'queued' AND next_attempt_at <= now() AND actor = ANY($1)
            ORDER BY next_attempt_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING *
        "#,
    )
    .bind(actors)
    .fetch_optional(pool)
    .await?;
    Ok(task)
}

pub async fn mark_succeeded(pool: &PgPool, task_id: i64) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = $1, updated_at = now() WHERE id = $2")
        .bind(TaskStatus::Succeeded.as_str())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_dead_letter(pool: &PgPool, task_id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = $1, last_error = $2, updated_at = now() WHERE id = $3")
        .bind(TaskStatus::DeadLetter.as_str())
        .bind(error)
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Redelivers `task_id` after an exponential backoff, or dead-letters it
/// if `attempts` has exhausted `max_retries`.
pub async fn retry_or_dead_letter(pool: &PgPool, task: &Task, error: &str) -> Result<()> {
    if task.attempts >= task.max_retries {
        return mark_dead_letter(pool, task.id, error).await;
    }
    let backoff_ms = (task.min_backoff_ms.saturating_mul(1i64 << (task.attempts - 1).max(0)))
        .min(task.max_backoff_ms)
        .max(task.min_backoff_ms);
    let next_attempt_at = Utc::now() + chrono::Duration::milliseconds(backoff_ms);
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'queued', last_error = $1, next_attempt_at = $2, updated_at = now()
        WHERE id = $3
        "#,
    )
    .bind(error)
    .bind(next_attempt_at)
    .bind(task.id)
    .execute(pool)
    .await?;
    Ok(())
}

impl From<sqlx::Error> for WorkerError {
    fn from(e: sqlx::Error) -> Self {
        WorkerError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let task = Task {
            id: 1,
            actor: "x".into(),
            payload: Value::Null,
            status: "running".into(),
            attempts: 4,
            max_retries: 10,
            min_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
            next_attempt_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let computed = (task.min_backoff_ms.saturating_mul(1i64 << (task.attempts - 1).max(0)))
            .min(task.max_backoff_ms);
        assert_eq!(computed, 5_000);
    }
}
