//! `PostgreSQL` storage for the rider loyalty ledger.
//!
//! This crate implements the storage traits from `loyalty-core` on top of sqlx:
//!
//! - [`PostgresRiderRegistry`]: the `riders` table
//! - [`PostgresRideLedger`]: the `rides` table, indexed on `rider_id` and
//!   `status_at_completion`
//! - [`PostgresDeadLetterQueue`]: the `parked_events` table, with a
//!   pending / resolved / discarded lifecycle
//!
//! Uniqueness is enforced by primary keys: inserts use
//! `ON CONFLICT (id) DO NOTHING RETURNING ...`, so a concurrent duplicate is
//! detected atomically without a read-then-write race.
//!
//! # Example
//!
//! ```ignore
//! use loyalty_postgres::{PostgresRideLedger, PostgresRiderRegistry};
//!
//! let pool = loyalty_postgres::connect("postgres://localhost/loyalty", 10).await?;
//! loyalty_postgres::migrate(&pool).await?;
//!
//! let registry = PostgresRiderRegistry::new(pool.clone());
//! let ledger = PostgresRideLedger::new(pool);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use loyalty_core::LoyaltyError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Dead-letter storage for exhausted events
pub mod dead_letter_queue;

mod riders;
mod rides;

pub use dead_letter_queue::{ParkedStatus, PostgresDeadLetterQueue, StoredParkedEvent};
pub use riders::PostgresRiderRegistry;
pub use rides::PostgresRideLedger;

/// Opens a connection pool.
///
/// # Errors
///
/// [`LoyaltyError::Persistence`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, LoyaltyError> {
    connect_with(database_url, max_connections, Duration::from_secs(5)).await
}

/// Opens a connection pool with an explicit acquire timeout.
///
/// # Errors
///
/// [`LoyaltyError::Persistence`] if the database is unreachable.
pub async fn connect_with(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, LoyaltyError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .map_err(db_error("connect"))?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Creates the `riders`, `rides` and `parked_events` tables and their indexes.
///
/// # Errors
///
/// [`LoyaltyError::Persistence`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), LoyaltyError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| LoyaltyError::Persistence(format!("migration failed: {e}")))?;
    Ok(())
}

/// Maps a sqlx error to [`LoyaltyError::Persistence`], naming the operation.
pub(crate) fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> LoyaltyError {
    move |e| LoyaltyError::Persistence(format!("failed to {operation}: {e}"))
}

/// Converts a stored non-negative integer column.
pub(crate) fn to_u64(value: i64, column: &'static str) -> Result<u64, LoyaltyError> {
    u64::try_from(value)
        .map_err(|_| LoyaltyError::Persistence(format!("negative value {value} in column {column}")))
}

/// Converts a value for a `BIGINT` column.
pub(crate) fn to_i64(value: u64, column: &'static str) -> Result<i64, LoyaltyError> {
    i64::try_from(value)
        .map_err(|_| LoyaltyError::Validation(format!("value {value} too large for column {column}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversions_reject_out_of_range() {
        assert_eq!(to_u64(7, "rides.loyalty_points"), Ok(7));
        assert!(to_u64(-1, "rides.loyalty_points").is_err());
        assert_eq!(to_i64(7, "rides.amount_cents"), Ok(7));
        assert!(matches!(
            to_i64(u64::MAX, "rides.amount_cents"),
            Err(LoyaltyError::Validation(_))
        ));
    }
}
