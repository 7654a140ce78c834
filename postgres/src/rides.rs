//! `rides` table.

use crate::{db_error, to_i64, to_u64};
use chrono::{DateTime, Utc};
use loyalty_core::environment::{Clock, SystemClock};
use loyalty_core::model::{NewRide, ProjectedRide, Ride, RideField, RideFilter, RideProjection};
use loyalty_core::store::{RideLedger, StoreFuture};
use loyalty_core::{Amount, LoyaltyError, RideId, RiderId, Tier};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;

/// PostgreSQL-backed [`RideLedger`].
///
/// Amounts are stored as integer cents. Reads select only the projected
/// columns and are ordered by `finished_at`, then `id`.
#[derive(Clone)]
pub struct PostgresRideLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresRideLedger {
    /// Creates a ledger over `pool`, defaulting `finished_at` from the system clock.
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

const fn column(field: RideField) -> &'static str {
    match field {
        RideField::RiderId => "rider_id",
        RideField::Amount => "amount_cents",
        RideField::FinishedAt => "finished_at",
        RideField::StatusAtCompletion => "status_at_completion",
        RideField::LoyaltyPoints => "loyalty_points",
    }
}

fn corrupt(e: impl std::fmt::Display) -> LoyaltyError {
    LoyaltyError::Persistence(format!("corrupt ride row: {e}"))
}

fn get<'r, T>(row: &'r PgRow, field: RideField) -> Result<T, LoyaltyError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column(field)).map_err(db_error("decode ride"))
}

fn decode_projected(row: &PgRow, projection: &RideProjection) -> Result<ProjectedRide, LoyaltyError> {
    let id: String = row.try_get("id").map_err(db_error("decode ride"))?;
    let mut ride = ProjectedRide {
        id: RideId::parse(&id).map_err(corrupt)?,
        rider_id: None,
        amount: None,
        finished_at: None,
        status_at_completion: None,
        loyalty_points: None,
    };

    for &field in projection.fields() {
        match field {
            RideField::RiderId => {
                let rider_id: String = get(row, field)?;
                ride.rider_id = Some(RiderId::parse(&rider_id).map_err(corrupt)?);
            }
            RideField::Amount => {
                let cents: i64 = get(row, field)?;
                ride.amount = Some(Amount::from_cents(to_u64(cents, "rides.amount_cents")?));
            }
            RideField::FinishedAt => {
                ride.finished_at = Some(get::<DateTime<Utc>>(row, field)?);
            }
            RideField::StatusAtCompletion => {
                let status: String = get(row, field)?;
                ride.status_at_completion = Some(status.parse::<Tier>().map_err(corrupt)?);
            }
            RideField::LoyaltyPoints => {
                let points: i64 = get(row, field)?;
                ride.loyalty_points = Some(to_u64(points, "rides.loyalty_points")?);
            }
        }
    }
    Ok(ride)
}

fn select(projection: &RideProjection) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("SELECT id");
    for &field in projection.fields() {
        query.push(", ").push(column(field));
    }
    query.push(" FROM rides");
    query
}

impl RideLedger for PostgresRideLedger {
    fn record(&self, ride: NewRide) -> StoreFuture<'_, Ride> {
        Box::pin(async move {
            let ride = ride.into_ride(self.clock.now());
            let inserted: Option<(DateTime<Utc>,)> = sqlx::query_as(
                r"
                INSERT INTO rides (
                    id, rider_id, amount_cents, finished_at, status_at_completion, loyalty_points
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                RETURNING finished_at
                ",
            )
            .bind(ride.id.as_str())
            .bind(ride.rider_id.as_str())
            .bind(to_i64(ride.amount.cents(), "rides.amount_cents")?)
            .bind(ride.finished_at)
            .bind(ride.status_at_completion.as_str())
            .bind(to_i64(ride.loyalty_points, "rides.loyalty_points")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("insert ride"))?;

            let Some((finished_at,)) = inserted else {
                return Err(LoyaltyError::DuplicateRide(ride.id));
            };

            tracing::debug!(ride_id = %ride.id, rider_id = %ride.rider_id, "Ride row inserted");
            Ok(Ride { finished_at, ..ride })
        })
    }

    fn find_by_id(
        &self,
        id: &RideId,
        projection: &RideProjection,
    ) -> StoreFuture<'_, Option<ProjectedRide>> {
        let id = id.clone();
        let projection = projection.clone();
        Box::pin(async move {
            let mut query = select(&projection);
            query.push(" WHERE id = ").push_bind(id.as_str().to_string());

            let row = query
                .build()
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load ride"))?;

            row.map(|row| decode_projected(&row, &projection)).transpose()
        })
    }

    fn find(
        &self,
        filter: &RideFilter,
        projection: &RideProjection,
    ) -> StoreFuture<'_, Vec<ProjectedRide>> {
        let filter = filter.clone();
        let projection = projection.clone();
        Box::pin(async move {
            let mut query = select(&projection);
            query.push(" WHERE TRUE");
            if let Some(rider_id) = &filter.rider_id {
                query.push(" AND rider_id = ").push_bind(rider_id.as_str().to_string());
            }
            if let Some(tier) = filter.status_at_completion {
                query.push(" AND status_at_completion = ").push_bind(tier.as_str());
            }
            query.push(" ORDER BY finished_at, id");

            let rows = query
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("query rides"))?;

            rows.iter()
                .map(|row| decode_projected(row, &projection))
                .collect()
        })
    }

    fn count_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64> {
        let rider_id = rider_id.clone();
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rides WHERE rider_id = $1")
                .bind(rider_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("count rides"))?;

            to_u64(count, "count")
        })
    }

    fn points_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64> {
        let rider_id = rider_id.clone();
        Box::pin(async move {
            let (points,): (i64,) = sqlx::query_as(
                "SELECT COALESCE(SUM(loyalty_points), 0)::BIGINT FROM rides WHERE rider_id = $1",
            )
            .bind(rider_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("sum loyalty points"))?;

            to_u64(points, "sum")
        })
    }

    fn contains(&self, id: &RideId) -> StoreFuture<'_, bool> {
        let id = id.clone();
        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM rides WHERE id = $1)")
                    .bind(id.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_error("check ride"))?;
            Ok(exists)
        })
    }
}
