//! `riders` table.

use crate::db_error;
use chrono::{DateTime, Utc};
use loyalty_core::environment::{Clock, SystemClock};
use loyalty_core::model::Rider;
use loyalty_core::store::{RiderRegistry, StoreFuture};
use loyalty_core::{LoyaltyError, RiderId, RiderName, Tier};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;

/// PostgreSQL-backed [`RiderRegistry`].
///
/// `created_at` comes from the injected clock and is read back from the
/// inserted row, so the returned record matches later reads exactly.
#[derive(Clone)]
pub struct PostgresRiderRegistry {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresRiderRegistry {
    /// Creates a registry over `pool`, timestamped by the system clock.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(e: impl std::fmt::Display) -> LoyaltyError {
    LoyaltyError::Persistence(format!("corrupt rider row: {e}"))
}

fn decode_rider(row: &PgRow) -> Result<Rider, LoyaltyError> {
    let id: String = row.try_get("id").map_err(db_error("decode rider"))?;
    let name: String = row.try_get("name").map_err(db_error("decode rider"))?;
    let status: String = row.try_get("status").map_err(db_error("decode rider"))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_error("decode rider"))?;

    Ok(Rider {
        id: RiderId::parse(&id).map_err(corrupt)?,
        name: RiderName::parse(name).map_err(corrupt)?,
        status: status.parse::<Tier>().map_err(corrupt)?,
        created_at,
    })
}

impl RiderRegistry for PostgresRiderRegistry {
    fn register(&self, id: &RiderId, name: &RiderName, status: Tier) -> StoreFuture<'_, Rider> {
        let id = id.clone();
        let name = name.clone();
        Box::pin(async move {
            let inserted: Option<(DateTime<Utc>,)> = sqlx::query_as(
                r"
                INSERT INTO riders (id, name, status, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                RETURNING created_at
                ",
            )
            .bind(id.as_str())
            .bind(name.as_str())
            .bind(status.as_str())
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("insert rider"))?;

            let Some((created_at,)) = inserted else {
                return Err(LoyaltyError::AlreadyExists(id));
            };

            tracing::debug!(rider_id = %id, status = %status, "Rider row inserted");
            Ok(Rider {
                id,
                name,
                status,
                created_at,
            })
        })
    }

    fn find(&self, id: &RiderId) -> StoreFuture<'_, Option<Rider>> {
        let id = id.clone();
        Box::pin(async move {
            let row = sqlx::query("SELECT id, name, status, created_at FROM riders WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load rider"))?;

            row.as_ref().map(decode_rider).transpose()
        })
    }

    fn set_status(&self, id: &RiderId, status: Tier) -> StoreFuture<'_, ()> {
        let id = id.clone();
        Box::pin(async move {
            let result = sqlx::query("UPDATE riders SET status = $2 WHERE id = $1")
                .bind(id.as_str())
                .bind(status.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error("update rider status"))?;

            if result.rows_affected() == 0 {
                return Err(LoyaltyError::NotFound(id));
            }
            Ok(())
        })
    }

    fn compare_and_set_status(
        &self,
        id: &RiderId,
        expected: Tier,
        new: Tier,
    ) -> StoreFuture<'_, bool> {
        let id = id.clone();
        Box::pin(async move {
            let result = sqlx::query("UPDATE riders SET status = $3 WHERE id = $1 AND status = $2")
                .bind(id.as_str())
                .bind(expected.as_str())
                .bind(new.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error("update rider status"))?;

            if result.rows_affected() == 1 {
                return Ok(true);
            }

            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM riders WHERE id = $1)")
                    .bind(id.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_error("load rider"))?;

            if exists {
                Ok(false)
            } else {
                Err(LoyaltyError::NotFound(id))
            }
        })
    }
}
