//! Task runtime (C7): a Postgres-backed job queue with per-actor retry
//! policy, exponential backoff, dead-lettering, and a timeout-bounded
//! worker pool.

pub mod actor;
pub mod error;
pub mod queue;
pub mod runtime;
pub mod task;

pub use actor::Actor;
pub use error::{Result, WorkerError};
pub use runtime::{Registry, WorkerPool};
pub use task::{Task, TaskStatus};

pub async fn migrate(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(sqlx::Error::from)?;
    Ok(())
}
