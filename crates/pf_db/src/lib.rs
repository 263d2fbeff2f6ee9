//! Entity store (C2), record locking (C5), auto-increment allocation (C6),
//! and the distributed-mutex KV table that backs recovery.

pub mod alloc;
pub mod error;
pub mod kv;
pub mod lock;
pub mod models;
pub mod store;

pub use error::{DbError, Result};

/// All five tables live in one Postgres database; there is no per-tenant
/// sharding in scope.
pub type Pool = sqlx::PgPool;

pub async fn connect(database_url: &str) -> Result<Pool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(sqlx::Error::from)?;
    Ok(())
}
