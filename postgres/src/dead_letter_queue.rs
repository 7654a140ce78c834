//! Dead-letter queue for events that exhausted redelivery.
//!
//! Parked events are stored with the failure that sank them and can then be
//! inspected, resolved after manual replay, or discarded.

use crate::{db_error, to_u64};
use chrono::{DateTime, Utc};
use loyalty_core::dead_letter::{DeadLetterSink, ParkedEvent};
use loyalty_core::store::StoreFuture;
use loyalty_core::{FailureKind, LoyaltyError};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Lifecycle of a parked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkedStatus {
    /// Awaiting investigation.
    Pending,
    /// Replayed or otherwise fixed.
    Resolved,
    /// Permanently abandoned.
    Discarded,
}

impl ParkedStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, LoyaltyError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(LoyaltyError::Persistence(format!(
                "invalid parked event status: {s}"
            ))),
        }
    }
}

/// A row of the `parked_events` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredParkedEvent {
    /// Queue entry id.
    pub id: i64,
    /// The parked event.
    pub event: ParkedEvent,
    /// Current status.
    pub status: ParkedStatus,
    /// When the entry left `pending`.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// What was done.
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL` dead-letter queue.
///
/// # Example
///
/// ```no_run
/// use loyalty_postgres::PostgresDeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let queue = PostgresDeadLetterQueue::new(pool);
///
/// for entry in queue.list_pending(100).await? {
///     println!("{} failed with {}", entry.event.routing_key, entry.event.failure);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

const COLUMNS: &str = "id, routing_key, payload, failure, error_message, attempts, rider_id, \
                       ride_id, parked_at, status, resolved_at, resolved_by, resolution_notes";

impl PostgresDeadLetterQueue {
    /// Creates a queue over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a parked event and returns its entry id.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the insert fails.
    pub async fn add_entry(&self, event: &ParkedEvent) -> Result<i64, LoyaltyError> {
        let attempts = i32::try_from(event.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO parked_events (
                routing_key, payload, failure, error_message, attempts,
                rider_id, ride_id, parked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&event.routing_key)
        .bind(&event.payload)
        .bind(event.failure.as_str())
        .bind(&event.error_message)
        .bind(attempts)
        .bind(event.rider_id.as_deref())
        .bind(event.ride_id.as_deref())
        .bind(event.parked_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("park event"))?;

        tracing::warn!(
            parked_id = id,
            routing_key = %event.routing_key,
            failure = %event.failure,
            attempts = event.attempts,
            "Event parked in dead-letter queue"
        );
        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<StoredParkedEvent>, LoyaltyError> {
        self.list_by_status(ParkedStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: ParkedStatus,
        limit: usize,
    ) -> Result<Vec<StoredParkedEvent>, LoyaltyError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM parked_events WHERE status = $1 ORDER BY parked_at, id LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list parked events"))?;

        rows.iter().map(Self::decode).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<StoredParkedEvent>, LoyaltyError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM parked_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("load parked event"))?;

        row.as_ref().map(Self::decode).transpose()
    }

    /// Marks a pending entry resolved. Returns false if no pending entry has `id`.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<bool, LoyaltyError> {
        let result = sqlx::query(
            r"
            UPDATE parked_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3 AND status = 'pending'
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("resolve parked event"))?;

        let updated = result.rows_affected() == 1;
        if updated {
            tracing::info!(parked_id = id, resolved_by, "Parked event resolved");
            metrics::counter!("loyalty_parked_events_resolved_total").increment(1);
        }
        Ok(updated)
    }

    /// Marks a pending entry discarded. Returns false if no pending entry has `id`.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<bool, LoyaltyError> {
        let result = sqlx::query(
            r"
            UPDATE parked_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2 AND status = 'pending'
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("discard parked event"))?;

        let updated = result.rows_affected() == 1;
        if updated {
            tracing::warn!(parked_id = id, reason, "Parked event discarded");
            metrics::counter!("loyalty_parked_events_discarded_total").increment(1);
        }
        Ok(updated)
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, LoyaltyError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM parked_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("count parked events"))?;

        to_u64(count, "count")
    }

    fn decode(row: &PgRow) -> Result<StoredParkedEvent, LoyaltyError> {
        let decode = db_error("decode parked event");

        let failure: String = row.try_get("failure").map_err(&decode)?;
        let failure = FailureKind::parse(&failure).ok_or_else(|| {
            LoyaltyError::Persistence(format!("invalid failure kind: {failure}"))
        })?;
        let attempts: i32 = row.try_get("attempts").map_err(&decode)?;
        let status: String = row.try_get("status").map_err(&decode)?;

        Ok(StoredParkedEvent {
            id: row.try_get("id").map_err(&decode)?,
            event: ParkedEvent {
                routing_key: row.try_get("routing_key").map_err(&decode)?,
                payload: row.try_get("payload").map_err(&decode)?,
                failure,
                error_message: row.try_get("error_message").map_err(&decode)?,
                attempts: u32::try_from(attempts).unwrap_or_default(),
                rider_id: row.try_get("rider_id").map_err(&decode)?,
                ride_id: row.try_get("ride_id").map_err(&decode)?,
                parked_at: row.try_get("parked_at").map_err(&decode)?,
            },
            status: ParkedStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(&decode)?,
            resolved_by: row.try_get("resolved_by").map_err(&decode)?,
            resolution_notes: row.try_get("resolution_notes").map_err(&decode)?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn park(&self, event: ParkedEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.add_entry(&event).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parked_status_roundtrip() {
        for status in [
            ParkedStatus::Pending,
            ParkedStatus::Resolved,
            ParkedStatus::Discarded,
        ] {
            assert_eq!(ParkedStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn parked_status_invalid() {
        assert!(ParkedStatus::parse("processing").is_err());
    }
}
