//! Keyed TTL lock table backing the distributed mutex and the per-record
//! dedup lock.
//!
//! Both locks are the same primitive; "claim this key until it expires,
//! unless someone already holds an unexpired claim"; expressed as one
//! upsert that only overwrites an expired row. The worker-boot mutex
//! additionally releases on a clean exit; the per-record dedup lock never
//! does, by design, so a second recovery pass within the TTL window finds
//! the row still held and skips re-dispatching the record.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::Pool;

/// Attempts to claim `key` for `holder` until `now + ttl`. Succeeds either
/// when the key is unclaimed or when the existing claim has expired;
/// fails (returns `false`) when another holder's claim is still live.
pub async fn try_acquire(pool: &Pool, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
    let expires_at: DateTime<Utc> = Utc::now() + ttl;
    let claimed = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO distributed_locks (key, holder, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE distributed_locks.expires_at < now()
        RETURNING key
        "#,
    )
    .bind(key)
    .bind(holder)
    .bind(expires_at)
    .fetch_optional(pool)
    .await?;
    Ok(claimed.is_some())
}

/// Releases a claim, but only if `holder` still owns it; a worker whose
/// claim already expired and was reclaimed by someone else must not
/// delete the new owner's row.
pub async fn release(pool: &Pool, key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM distributed_locks WHERE key = $1 AND holder = $2")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

/// The worker-boot distributed mutex: exactly one worker wins the
/// election and enqueues the Recovery task.
pub async fn try_acquire_boot_mutex(pool: &Pool, holder: &str, ttl: Duration) -> Result<bool> {
    try_acquire(pool, "recovery:boot-mutex", holder, ttl).await
}

/// The per-record dedup lock: prevents a second recovery pass from
/// re-enqueueing a record already dispatched within the last `ttl`.
/// Intentionally has no matching `release`; it expires on its own.
pub async fn try_acquire_dedup_lock(
    pool: &Pool,
    table: &str,
    record_id: i64,
    ttl: Duration,
) -> Result<bool> {
    let key = format!("recovery:dedup:{table}:{record_id}");
    try_acquire(pool, &key, "recovery", ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_namespaced_per_table() {
        assert_ne!(
            format!("recovery:dedup:{}:{}", "coloring_versions", 1),
            format!("recovery:dedup:{}:{}", "svg_versions", 1)
        );
    }
}
