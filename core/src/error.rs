//! Error taxonomy for the loyalty ledger.
//!
//! [`LoyaltyError`] is the closed set of failures returned by stores and
//! coordinators. [`EventError`] wraps one of them with the context of the bus
//! message that produced it, so that a single log line or dead-letter record
//! carries everything needed to diagnose the event.

use crate::types::{RideId, RiderId, ValueError};
use crate::tier::TierTableError;
use std::fmt;
use thiserror::Error;

/// Domain failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoyaltyError {
    /// Malformed or out-of-range input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A rider with this id is already registered.
    #[error("rider {0} already exists")]
    AlreadyExists(RiderId),

    /// A ride with this id is already recorded.
    #[error("ride {0} already recorded")]
    DuplicateRide(RideId),

    /// The completion event references a rider that is not registered (yet).
    #[error("rider {0} is not registered")]
    UnknownRider(RiderId),

    /// `set_status` on a rider that does not exist.
    #[error("rider {0} not found")]
    NotFound(RiderId),

    /// Storage backend failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl LoyaltyError {
    /// Failure category used for metrics labels and dispositions.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::AlreadyExists(_) => FailureKind::AlreadyExists,
            Self::DuplicateRide(_) => FailureKind::DuplicateRide,
            Self::UnknownRider(_) => FailureKind::UnknownRider,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Persistence(_) => FailureKind::Persistence,
        }
    }

    /// Whether redelivering the event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ValueError> for LoyaltyError {
    fn from(error: ValueError) -> Self {
        Self::Validation(error.to_string())
    }
}

impl From<TierTableError> for LoyaltyError {
    fn from(error: TierTableError) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Label-friendly failure category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// See [`LoyaltyError::Validation`].
    Validation,
    /// See [`LoyaltyError::AlreadyExists`].
    AlreadyExists,
    /// See [`LoyaltyError::DuplicateRide`].
    DuplicateRide,
    /// See [`LoyaltyError::UnknownRider`].
    UnknownRider,
    /// See [`LoyaltyError::NotFound`].
    NotFound,
    /// See [`LoyaltyError::Persistence`].
    Persistence,
}

impl FailureKind {
    /// Every kind.
    pub const ALL: [Self; 6] = [
        Self::Validation,
        Self::AlreadyExists,
        Self::DuplicateRide,
        Self::UnknownRider,
        Self::NotFound,
        Self::Persistence,
    ];

    /// Inverse of [`FailureKind::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::AlreadyExists => "already_exists",
            Self::DuplicateRide => "duplicate_ride",
            Self::UnknownRider => "unknown_rider",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
        }
    }

    /// Retryable kinds get bounded redelivery.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UnknownRider | Self::Persistence)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a completion event through its coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompletionStage {
    /// Payload accepted.
    Received,
    /// Rider existence confirmed.
    RiderChecked,
    /// Ride durably recorded.
    RideRecorded,
    /// Tier recomputed and written back.
    StatusReconciled,
    /// Finished.
    Done,
}

impl CompletionStage {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::RiderChecked => "rider_checked",
            Self::RideRecorded => "ride_recorded",
            Self::StatusReconciled => "status_reconciled",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for CompletionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure tied to a single bus message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{routing_key}: {source}")]
pub struct EventError {
    /// Routing key the message arrived on.
    pub routing_key: String,
    /// Envelope `type`, when it could be read.
    pub event_type: Option<String>,
    /// Rider id, when it could be read.
    pub rider_id: Option<String>,
    /// Ride id, when it could be read.
    pub ride_id: Option<String>,
    /// Last completion stage reached (completion events only).
    pub stage: Option<CompletionStage>,
    /// Underlying failure.
    #[source]
    pub source: LoyaltyError,
}

impl EventError {
    /// Wraps `source` for a message on `routing_key`.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, source: LoyaltyError) -> Self {
        Self {
            routing_key: routing_key.into(),
            event_type: None,
            rider_id: None,
            ride_id: None,
            stage: None,
            source,
        }
    }

    /// Sets the envelope type.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the rider id.
    #[must_use]
    pub fn with_rider(mut self, rider_id: impl Into<String>) -> Self {
        self.rider_id = Some(rider_id.into());
        self
    }

    /// Sets the ride id.
    #[must_use]
    pub fn with_ride(mut self, ride_id: impl Into<String>) -> Self {
        self.ride_id = Some(ride_id.into());
        self
    }

    /// Sets the completion stage.
    #[must_use]
    pub const fn at_stage(mut self, stage: CompletionStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Failure category.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.source.kind()
    }

    /// Whether redelivery may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_unknown_rider_and_persistence_are_retryable() {
        let rider = RiderId::parse("000000000000000000000001").unwrap();
        let ride = RideId::parse("000000000000000000000002").unwrap();

        assert!(!LoyaltyError::Validation("bad".into()).is_retryable());
        assert!(!LoyaltyError::AlreadyExists(rider.clone()).is_retryable());
        assert!(!LoyaltyError::DuplicateRide(ride).is_retryable());
        assert!(!LoyaltyError::NotFound(rider.clone()).is_retryable());
        assert!(LoyaltyError::UnknownRider(rider).is_retryable());
        assert!(LoyaltyError::Persistence("down".into()).is_retryable());
    }

    #[test]
    fn value_errors_become_validation_failures() {
        let error: LoyaltyError = RiderId::parse("nope").unwrap_err().into();
        assert_eq!(error.kind(), FailureKind::Validation);
    }

    #[test]
    fn failure_kind_parses_its_labels() {
        for kind in FailureKind::ALL {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FailureKind::parse("timeout"), None);
    }

    #[test]
    fn event_error_carries_context() {
        let error = EventError::new("ride.completed", LoyaltyError::Persistence("io".into()))
            .with_event_type("ride_completed")
            .with_rider("000000000000000000000001")
            .with_ride("000000000000000000000002")
            .at_stage(CompletionStage::RideRecorded);

        assert_eq!(error.kind(), FailureKind::Persistence);
        assert_eq!(error.stage, Some(CompletionStage::RideRecorded));
        assert_eq!(error.to_string(), "ride.completed: persistence error: io");
        assert!(error.is_retryable());
    }
}
