//! Orchestration of signup and ride-completion events.
//!
//! # Completion flow
//!
//! ```text
//! Received ──► RiderChecked ──► RideRecorded ──► StatusReconciled ──► Done
//!    │              │                │                  │
//!    │ duplicate    │ unknown rider  │ insert failed    │ tier write failed
//!    ▼              ▼                ▼                  ▼
//!  reconcile,    UnknownRider    record error     ride stays durable,
//!  DuplicateRide (retryable)                      reconcile is retried
//! ```
//!
//! The whole sequence runs under the rider's lock from [`RiderLocks`]. The tier
//! write additionally goes through `compare_and_set_status` so that several
//! processes sharing one database cannot lose a promotion or move a rider down.

use crate::locks::RiderLocks;
use crate::metrics::LoyaltyMetrics;
use crate::redelivery::{RedeliveryPolicy, retry_transient};
use loyalty_core::event::{CompletionEvent, SignupEvent};
use loyalty_core::store::{RideLedger, RiderRegistry};
use loyalty_core::{
    CompletionStage, LoyaltyError, NewRide, Ride, RideField, RideProjection, Rider, RiderId, Tier,
    TierTable,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of compare-and-set rounds before a tier write is reported as a
/// persistence conflict.
pub const DEFAULT_STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Handles `rider.signup`.
#[derive(Clone)]
pub struct SignupCoordinator {
    registry: Arc<dyn RiderRegistry>,
    tiers: Arc<TierTable>,
}

impl SignupCoordinator {
    /// Creates a coordinator writing to `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn RiderRegistry>, tiers: Arc<TierTable>) -> Self {
        Self { registry, tiers }
    }

    /// Registers the rider at the lowest tier.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::AlreadyExists`] for a redelivered or conflicting signup
    /// - [`LoyaltyError::Persistence`] on storage failure
    #[tracing::instrument(skip_all, fields(rider_id = %event.rider_id))]
    pub async fn handle(&self, event: &SignupEvent) -> Result<Rider, LoyaltyError> {
        if self.registry.find(&event.rider_id).await?.is_some() {
            warn!("Rider already exists, nothing has been done");
            return Err(LoyaltyError::AlreadyExists(event.rider_id.clone()));
        }

        let rider = self
            .registry
            .register(&event.rider_id, &event.name, self.tiers.lowest())
            .await?;
        info!(status = %rider.status, "Rider registered");
        Ok(rider)
    }
}

/// A tier change written back to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Promotion {
    /// Tier before the write.
    pub from: Tier,
    /// Tier after the write.
    pub to: Tier,
    /// Completed rides that triggered it.
    pub completed_rides: u64,
}

/// Successful completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// The stored ride.
    pub ride: Ride,
    /// Tier change caused by this ride, if any.
    pub promotion: Option<Promotion>,
}

/// Failed completion, with the last stage reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source} (stage: {stage})")]
pub struct StageError {
    /// Last stage reached before the failure.
    pub stage: CompletionStage,
    /// Underlying failure.
    #[source]
    pub source: LoyaltyError,
}

impl StageError {
    fn at(stage: CompletionStage) -> impl FnOnce(LoyaltyError) -> Self {
        move |source| Self { stage, source }
    }
}

/// Handles `ride.completed`.
#[derive(Clone)]
pub struct CompletionCoordinator {
    registry: Arc<dyn RiderRegistry>,
    ledger: Arc<dyn RideLedger>,
    tiers: Arc<TierTable>,
    locks: RiderLocks,
    reconcile_policy: RedeliveryPolicy,
    status_write_attempts: u32,
}

impl CompletionCoordinator {
    /// Creates a coordinator with its own lock table.
    #[must_use]
    pub fn new(
        registry: Arc<dyn RiderRegistry>,
        ledger: Arc<dyn RideLedger>,
        tiers: Arc<TierTable>,
    ) -> Self {
        Self {
            registry,
            ledger,
            tiers,
            locks: RiderLocks::new(),
            reconcile_policy: RedeliveryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(1))
                .build(),
            status_write_attempts: DEFAULT_STATUS_WRITE_ATTEMPTS,
        }
    }

    /// Shares a lock table with other coordinators.
    #[must_use]
    pub fn with_locks(mut self, locks: RiderLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Sets how transient failures during reconciliation are retried in place.
    #[must_use]
    pub fn with_reconcile_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.reconcile_policy = policy;
        self
    }

    /// Sets the number of compare-and-set rounds per tier write.
    #[must_use]
    pub fn with_status_write_attempts(mut self, attempts: u32) -> Self {
        self.status_write_attempts = attempts.max(1);
        self
    }

    /// Records a completed ride and reconciles the rider's tier.
    ///
    /// Points are computed from the tier the rider holds *before* this ride.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::DuplicateRide`] if the ride is already recorded
    ///   (the rider's tier is reconciled first)
    /// - [`LoyaltyError::UnknownRider`] if the rider is not registered
    /// - [`LoyaltyError::Persistence`] on storage failure
    ///
    /// The error carries the last [`CompletionStage`] reached.
    #[tracing::instrument(skip_all, fields(ride_id = %event.ride_id, rider_id = %event.rider_id))]
    pub async fn handle(&self, event: &CompletionEvent) -> Result<CompletionOutcome, StageError> {
        let guard = self.locks.lock(&event.rider_id).await;
        debug!(amount = %event.amount, "Received completed ride event");

        if self
            .ledger
            .contains(&event.ride_id)
            .await
            .map_err(StageError::at(CompletionStage::Received))?
        {
            drop(guard);
            return Err(self.handle_duplicate(event).await);
        }

        let rider = self
            .registry
            .find(&event.rider_id)
            .await
            .map_err(StageError::at(CompletionStage::Received))?
            .ok_or_else(|| StageError {
                stage: CompletionStage::Received,
                source: LoyaltyError::UnknownRider(event.rider_id.clone()),
            })?;

        let ride = self
            .ledger
            .record(NewRide::complete(
                event.ride_id.clone(),
                event.rider_id.clone(),
                event.amount,
                rider.status,
                &self.tiers,
            ))
            .await
            .map_err(StageError::at(CompletionStage::RiderChecked))?;
        LoyaltyMetrics::record_ride(ride.loyalty_points);
        info!(
            status_at_completion = %ride.status_at_completion,
            loyalty_points = ride.loyalty_points,
            "Ride recorded"
        );

        let promotion = self
            .reconcile_locked(&event.rider_id)
            .await
            .map_err(StageError::at(CompletionStage::RideRecorded))?;

        debug!(stage = %CompletionStage::Done, "Completion handled");
        Ok(CompletionOutcome { ride, promotion })
    }

    /// Reconciles the stored ride's owner, which may differ from the rider
    /// named by the repeated event, then reports the duplicate.
    ///
    /// An unknown owner does not mask the duplicate. Storage failures that
    /// outlast the in-place retries are returned so the event is redelivered.
    async fn handle_duplicate(&self, event: &CompletionEvent) -> StageError {
        let duplicate = StageError {
            stage: CompletionStage::Received,
            source: LoyaltyError::DuplicateRide(event.ride_id.clone()),
        };

        let stored = match self
            .ledger
            .find_by_id(&event.ride_id, &RideProjection::only([RideField::RiderId]))
            .await
        {
            Ok(stored) => stored,
            Err(source) => {
                return StageError {
                    stage: CompletionStage::Received,
                    source,
                };
            }
        };
        let Some(owner) = stored.and_then(|ride| ride.rider_id) else {
            return duplicate;
        };

        if owner == event.rider_id {
            warn!("Ride already recorded, reconciling tier only");
        } else {
            warn!(owner = %owner, "Ride already recorded for another rider, reconciling its owner");
        }

        match self.reconcile(&owner).await {
            Ok(_) => duplicate,
            Err(LoyaltyError::NotFound(_)) => {
                warn!(owner = %owner, "Owner of duplicate ride is not registered");
                duplicate
            }
            Err(source) => StageError {
                stage: CompletionStage::RideRecorded,
                source,
            },
        }
    }

    /// Recomputes a rider's tier from their completed-ride count and writes it
    /// back if it is higher than the stored one. Idempotent.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::NotFound`] if the rider does not exist
    /// - [`LoyaltyError::Persistence`] once in-place retries are exhausted
    pub async fn reconcile(&self, rider_id: &RiderId) -> Result<Option<Promotion>, LoyaltyError> {
        let _guard = self.locks.lock(rider_id).await;
        self.reconcile_locked(rider_id).await
    }

    async fn reconcile_locked(&self, rider_id: &RiderId) -> Result<Option<Promotion>, LoyaltyError> {
        retry_transient(&self.reconcile_policy, |_| self.reconcile_once(rider_id)).await
    }

    async fn reconcile_once(&self, rider_id: &RiderId) -> Result<Option<Promotion>, LoyaltyError> {
        for round in 1..=self.status_write_attempts {
            let current = self
                .registry
                .find(rider_id)
                .await?
                .ok_or_else(|| LoyaltyError::NotFound(rider_id.clone()))?
                .status;
            let completed_rides = self.ledger.count_for_rider(rider_id).await?;
            let target = self.tiers.resolve_tier(completed_rides);

            if target <= current {
                debug!(%current, completed_rides, "Tier unchanged");
                return Ok(None);
            }

            if self
                .registry
                .compare_and_set_status(rider_id, current, target)
                .await?
            {
                LoyaltyMetrics::record_promotion(target);
                info!(from = %current, to = %target, completed_rides, "Rider promoted");
                return Ok(Some(Promotion {
                    from: current,
                    to: target,
                    completed_rides,
                }));
            }

            debug!(round, "Rider status changed concurrently, re-reading");
        }

        Err(LoyaltyError::Persistence(format!(
            "status write for rider {rider_id} conflicted {} times",
            self.status_write_attempts
        )))
    }
}
