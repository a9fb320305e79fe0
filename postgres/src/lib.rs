//! `PostgreSQL` backend for the replay outbox.
//!
//! This crate binds the store ports of `replay-outbox-core` to `PostgreSQL` via
//! sqlx:
//!
//! - [`PgTransactionManager`]: pool-backed transactions for the orchestrator,
//!   the send buffer and the poller
//! - [`PgSendProcedure`]: calls the send function (`send_to_mq` by default)
//! - [`PgReadProcedure`]: calls the read-batch function (`read_from_mq` by default)
//! - [`PgProcessedLedger`]: the `processed_message` idempotency table
//!
//! The embedded migration creates the tables and reference implementations of
//! both functions.
//!
//! # Example
//!
//! ```ignore
//! use replay_outbox_postgres::{connect, migrate, PgSendProcedure, PgTransactionManager};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/primary", 10).await?;
//!     migrate(&pool).await?;
//!     let manager = PgTransactionManager::new(pool);
//!     let send = PgSendProcedure::new("send_to_mq")?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use replay_outbox_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub mod ledger;
pub mod procedures;
pub mod transaction;

pub use ledger::PgProcessedLedger;
pub use procedures::{PgReadProcedure, PgSendProcedure};
pub use transaction::{PgTransaction, PgTransactionManager};

/// SQLSTATE `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(store_error)
}

/// Apply the embedded migrations.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
    tracing::info!("Replay outbox migrations applied");
    Ok(())
}

/// Classify a sqlx error.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db)
            if matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
            ) =>
        {
            StoreError::Conflict(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(error.to_string())
        }
        _ => StoreError::Database(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_database_failures() {
        assert!(matches!(
            store_error(sqlx::Error::PoolTimedOut),
            StoreError::Database(_)
        ));
        assert!(matches!(
            store_error(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn decode_errors_are_serialization_failures() {
        let error = sqlx::Error::Decode("bad jsonb".into());
        assert!(matches!(store_error(error), StoreError::Serialization(_)));
    }
}
