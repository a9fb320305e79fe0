//! Pool-backed transactions.

use crate::store_error;
use replay_outbox_core::{StoreError, Transaction, TransactionManager};
use sqlx::{PgConnection, PgPool, Postgres};
use std::fmt;

/// Opens transactions on a [`PgPool`].
#[derive(Debug, Clone)]
pub struct PgTransactionManager {
    pool: PgPool,
}

impl PgTransactionManager {
    /// Manager over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TransactionManager for PgTransactionManager {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let inner = self.pool.begin().await.map_err(store_error)?;
        Ok(PgTransaction { inner })
    }
}

/// One open `PostgreSQL` transaction.
///
/// Dropped without commit, sqlx rolls it back when the connection returns to
/// the pool.
pub struct PgTransaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

impl fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

impl Transaction for PgTransaction {
    type Connection = PgConnection;

    fn connection(&mut self) -> &mut PgConnection {
        &mut self.inner
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await.map_err(store_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await.map_err(store_error)
    }
}
