//! Final disposition for events that exhausted their redelivery budget.

use crate::error::{EventError, FailureKind};
use crate::store::StoreFuture;
use chrono::{DateTime, Utc};

/// An event set aside after its last attempt failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParkedEvent {
    /// Routing key the message arrived on.
    pub routing_key: String,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Category of the last failure.
    pub failure: FailureKind,
    /// Message of the last failure.
    pub error_message: String,
    /// Attempts made.
    pub attempts: u32,
    /// Rider id from the body, if readable.
    pub rider_id: Option<String>,
    /// Ride id from the body, if readable.
    pub ride_id: Option<String>,
    /// When the event was parked.
    pub parked_at: DateTime<Utc>,
}

impl ParkedEvent {
    /// Builds a parked record from the final failure of a message.
    #[must_use]
    pub fn from_failure(
        error: &EventError,
        payload: Vec<u8>,
        attempts: u32,
        parked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            routing_key: error.routing_key.clone(),
            payload,
            failure: error.kind(),
            error_message: error.source.to_string(),
            attempts,
            rider_id: error.rider_id.clone(),
            ride_id: error.ride_id.clone(),
            parked_at,
        }
    }
}

/// Destination for parked events.
pub trait DeadLetterSink: Send + Sync {
    /// Stores a parked event.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`](crate::error::LoyaltyError::Persistence)
    /// on backend failure.
    fn park(&self, event: ParkedEvent) -> StoreFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoyaltyError;

    #[test]
    fn from_failure_copies_context() {
        let error = EventError::new("ride.completed", LoyaltyError::Persistence("down".into()))
            .with_ride("00000000000000000000000a")
            .with_rider("000000000000000000000001");
        let parked = ParkedEvent::from_failure(&error, b"{}".to_vec(), 2, Utc::now());

        assert_eq!(parked.failure, FailureKind::Persistence);
        assert_eq!(parked.error_message, "persistence error: down");
        assert_eq!(parked.attempts, 2);
        assert_eq!(parked.ride_id.as_deref(), Some("00000000000000000000000a"));
    }
}
