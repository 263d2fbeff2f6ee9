//! Record lock (C5): a short exclusive lock around a single row, used by
//! every pipeline service to make state transitions race-safe.
//!
//! Ported from `acquire_processing_lock` (`tasks/utils/processing_lock.py`),
//! which issues `SELECT ... FOR UPDATE NOWAIT` and returns a `LockResult`
//! describing why the caller should skip. Here the same shape is a
//! `Result<Option<Lock<T>>>`: `Ok(None)` is "not found", `Err(Locked)` is
//! "another worker has it", and the happy path hands back a guard scoped
//! to the open transaction.

use pf_core::ProcessingStatus;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, Transaction};

use crate::error::{DbError, Result};
use crate::Pool;

/// A row type that can be locked and advanced through its status machine.
///
/// Implemented for the handful of tables whose rows move through the
/// state sequences of `ColoringVersion`, `SvgVersion`, and
/// `Order`. `TABLE`/`ID_COLUMN` are compile-time constants fixed by our own
/// trait impls, never user input, so interpolating them into SQL text is
/// safe despite not going through sqlx's query macros.
pub trait Lockable: for<'r> FromRow<'r, PgRow> + Send + Unpin {
    type Status: ProcessingStatus;

    const TABLE: &'static str;

    fn raw_id(&self) -> i64;
    fn status(&self) -> Self::Status;
}

/// Holds an open transaction with one row locked inside it. Dropping the
/// guard without calling `commit`/`verify_and_update_status` rolls back,
/// releasing the lock; callers that merely inspect the record and decide
/// not to act can just let it drop.
pub struct Lock<'c, T: Lockable> {
    tx: Transaction<'c, Postgres>,
    record: T,
}

impl<'c, T: Lockable> Lock<'c, T> {
    pub fn record(&self) -> &T {
        &self.record
    }

    /// Blocks until the row's lock is available.
    pub async fn acquire(pool: &'c Pool, id: i64) -> Result<Option<Self>> {
        Self::acquire_inner(pool, id, false).await
    }

    /// `SELECT ... FOR UPDATE NOWAIT`; fails immediately with
    /// `DbError::Locked` instead of blocking, so a task racing another
    /// worker for the same record can exit gracefully.
    pub async fn acquire_no_wait(pool: &'c Pool, id: i64) -> Result<Option<Self>> {
        Self::acquire_inner(pool, id, true).await
    }

    async fn acquire_inner(pool: &'c Pool, id: i64, nowait: bool) -> Result<Option<Self>> {
        let mut tx = pool.begin().await?;
        let sql = format!(
            "SELECT * FROM {} WHERE id = $1 FOR UPDATE{}",
            T::TABLE,
            if nowait { " NOWAIT" } else { "" }
        );
        let record = match sqlx::query_as::<_, T>(&sql).bind(id).fetch_optional(&mut *tx).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                let db_err = DbError::from(e);
                return if nowait && db_err.is_lock_not_available() {
                    Err(DbError::Locked)
                } else {
                    Err(db_err)
                };
            }
        };
        Ok(Some(Lock { tx, record }))
    }

    /// Raw access to the open transaction, for callers that need to write
    /// columns `update_record`/`verify_and_update_status` don't cover
    /// (e.g. the final write of `file_ref` + selection pointer).
    pub fn transaction_mut(&mut self) -> &mut Transaction<'c, Postgres> {
        &mut self.tx
    }

    /// Commits the open transaction without changing status; used when
    /// the caller has already written whatever it needed via
    /// `transaction_mut`.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Transitions the row's status, first checking it is still one of
    /// `expected`. Two workers racing on the same record converge here:
    /// the loser finds its expected status already moved on and gets
    /// `UnexpectedStatus` instead of silently clobbering the winner.
    pub async fn verify_and_update_status(
        mut self,
        expected: &[T::Status],
        new_status: T::Status,
    ) -> Result<()> {
        let current = self.record.status();
        if !expected.iter().any(|s| s.as_str() == current.as_str()) {
            return Err(DbError::UnexpectedStatus {
                expected: expected.iter().map(|s| s.as_str().to_string()).collect(),
                actual: current.as_str().to_string(),
            });
        }
        let sql = format!("UPDATE {} SET status = $1 WHERE id = $2", T::TABLE);
        sqlx::query(&sql)
            .bind(new_status.as_str())
            .bind(self.record.raw_id())
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }
}

macro_rules! impl_lockable {
    ($ty:ty, $status:ty, $table:literal) => {
        impl Lockable for $ty {
            type Status = $status;
            const TABLE: &'static str = $table;

            fn raw_id(&self) -> i64 {
                self.id.get()
            }
            fn status(&self) -> Self::Status {
                *self.status
            }
        }
    };
}

impl_lockable!(crate::models::Order, pf_core::OrderStatus, "orders");
impl_lockable!(crate::models::ColoringVersion, pf_core::ColoringStatus, "coloring_versions");
impl_lockable!(crate::models::SvgVersion, pf_core::SvgStatus, "svg_versions");

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_lockable<T: Lockable>() {}

    #[test]
    fn version_tables_are_lockable() {
        assert_lockable::<crate::models::ColoringVersion>();
        assert_lockable::<crate::models::SvgVersion>();
        assert_lockable::<crate::models::Order>();
    }
}
