//! In-memory rider registry and ride ledger.
//!
//! Both stores keep their data behind an `Arc<RwLock<_>>`, so clones share
//! state. Failure injection counters make the next `n` matching calls fail
//! with [`LoyaltyError::Persistence`]; nothing is written on an injected
//! failure.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use crate::mocks::test_clock;
use loyalty_core::environment::Clock;
use loyalty_core::model::{NewRide, ProjectedRide, Ride, RideFilter, RideProjection, Rider};
use loyalty_core::store::{RideLedger, RiderRegistry, StoreFuture};
use loyalty_core::{LoyaltyError, RideId, RiderId, RiderName, Tier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected(operation: &str) -> LoyaltyError {
    LoyaltyError::Persistence(format!("injected {operation} failure"))
}

/// In-memory [`RiderRegistry`].
#[derive(Clone)]
pub struct InMemoryRiderRegistry {
    riders: Arc<RwLock<HashMap<RiderId, Rider>>>,
    clock: Arc<dyn Clock>,
    status_write_failures: Arc<AtomicU32>,
    read_failures: Arc<AtomicU32>,
}

impl InMemoryRiderRegistry {
    /// Create an empty registry stamped by [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty registry using `clock` for `created_at`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            riders: Arc::new(RwLock::new(HashMap::new())),
            clock,
            status_write_failures: Arc::new(AtomicU32::new(0)),
            read_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` status writes (`set_status`, `compare_and_set_status`)
    /// fail. Zero clears pending failures.
    pub fn fail_status_writes(&self, n: u32) {
        self.status_write_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` lookups fail.
    pub fn fail_reads(&self, n: u32) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    /// Snapshot of a stored rider.
    #[must_use]
    pub fn get(&self, id: &RiderId) -> Option<Rider> {
        self.riders.read().unwrap().get(id).cloned()
    }

    /// Number of registered riders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.riders.read().unwrap().len()
    }

    /// Whether no rider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.riders.read().unwrap().is_empty()
    }
}

impl Default for InMemoryRiderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RiderRegistry for InMemoryRiderRegistry {
    fn register(&self, id: &RiderId, name: &RiderName, status: Tier) -> StoreFuture<'_, Rider> {
        let id = id.clone();
        let name = name.clone();
        Box::pin(async move {
            let mut riders = self.riders.write().unwrap();
            if riders.contains_key(&id) {
                return Err(LoyaltyError::AlreadyExists(id));
            }
            let rider = Rider {
                id: id.clone(),
                name,
                status,
                created_at: self.clock.now(),
            };
            riders.insert(id, rider.clone());
            Ok(rider)
        })
    }

    fn find(&self, id: &RiderId) -> StoreFuture<'_, Option<Rider>> {
        let id = id.clone();
        Box::pin(async move {
            if take_failure(&self.read_failures) {
                return Err(injected("read"));
            }
            Ok(self.riders.read().unwrap().get(&id).cloned())
        })
    }

    fn set_status(&self, id: &RiderId, status: Tier) -> StoreFuture<'_, ()> {
        let id = id.clone();
        Box::pin(async move {
            if take_failure(&self.status_write_failures) {
                return Err(injected("status write"));
            }
            let mut riders = self.riders.write().unwrap();
            let rider = riders.get_mut(&id).ok_or(LoyaltyError::NotFound(id.clone()))?;
            rider.status = status;
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
            if take_failure(&self.status_write_failures) {
                return Err(injected("status write"));
            }
            let mut riders = self.riders.write().unwrap();
            let rider = riders.get_mut(&id).ok_or(LoyaltyError::NotFound(id.clone()))?;
            if rider.status != expected {
                return Ok(false);
            }
            rider.status = new;
            Ok(true)
        })
    }
}

/// In-memory [`RideLedger`].
#[derive(Clone)]
pub struct InMemoryRideLedger {
    rides: Arc<RwLock<HashMap<RideId, Ride>>>,
    clock: Arc<dyn Clock>,
    record_failures: Arc<AtomicU32>,
    read_failures: Arc<AtomicU32>,
}

impl InMemoryRideLedger {
    /// Create an empty ledger defaulting `finished_at` from [`test_clock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty ledger using `clock` for missing `finished_at`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rides: Arc::new(RwLock::new(HashMap::new())),
            clock,
            record_failures: Arc::new(AtomicU32::new(0)),
            read_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` calls to `record` fail.
    pub fn fail_next_records(&self, n: u32) {
        self.record_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads (lookups, counts, sums) fail.
    pub fn fail_reads(&self, n: u32) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    /// Snapshot of a stored ride.
    #[must_use]
    pub fn get(&self, id: &RideId) -> Option<Ride> {
        self.rides.read().unwrap().get(id).cloned()
    }

    /// Every stored ride, ordered by `finished_at` then id.
    #[must_use]
    pub fn rides(&self) -> Vec<Ride> {
        let mut rides: Vec<Ride> = self.rides.read().unwrap().values().cloned().collect();
        rides.sort_by(|a, b| (a.finished_at, &a.id).cmp(&(b.finished_at, &b.id)));
        rides
    }

    /// Number of stored rides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rides.read().unwrap().len()
    }

    /// Whether no ride is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rides.read().unwrap().is_empty()
    }

    fn check_read(&self) -> Result<(), LoyaltyError> {
        if take_failure(&self.read_failures) {
            Err(injected("read"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRideLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RideLedger for InMemoryRideLedger {
    fn record(&self, ride: NewRide) -> StoreFuture<'_, Ride> {
        Box::pin(async move {
            if take_failure(&self.record_failures) {
                return Err(injected("record"));
            }
            let mut rides = self.rides.write().unwrap();
            if rides.contains_key(&ride.id) {
                return Err(LoyaltyError::DuplicateRide(ride.id));
            }
            let stored = ride.into_ride(self.clock.now());
            rides.insert(stored.id.clone(), stored.clone());
            Ok(stored)
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
            self.check_read()?;
            Ok(self
                .rides
                .read()
                .unwrap()
                .get(&id)
                .map(|ride| projection.apply(ride)))
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
            self.check_read()?;
            Ok(self
                .rides()
                .iter()
                .filter(|ride| filter.matches(ride))
                .map(|ride| projection.apply(ride))
                .collect())
        })
    }

    fn count_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64> {
        let rider_id = rider_id.clone();
        Box::pin(async move {
            self.check_read()?;
            let rides = self.rides.read().unwrap();
            Ok(rides.values().filter(|ride| ride.rider_id == rider_id).count() as u64)
        })
    }

    fn points_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64> {
        let rider_id = rider_id.clone();
        Box::pin(async move {
            self.check_read()?;
            let rides = self.rides.read().unwrap();
            Ok(rides
                .values()
                .filter(|ride| ride.rider_id == rider_id)
                .map(|ride| ride.loyalty_points)
                .sum())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use loyalty_core::{Amount, RideField, TierTable};

    fn new_ride(ride: u32, rider: u32) -> NewRide {
        NewRide::complete(
            fixtures::ride_id(ride),
            fixtures::rider_id(rider),
            Amount::from_cents(1500),
            Tier::Bronze,
            &TierTable::standard(),
        )
    }

    #[tokio::test]
    async fn register_then_find() {
        let registry = InMemoryRiderRegistry::new();
        let rider = registry
            .register(&fixtures::rider_id(1), &fixtures::name("John Doe"), Tier::Bronze)
            .await
            .unwrap();
        assert_eq!(rider.created_at, test_clock().now());
        assert_eq!(registry.find(&fixtures::rider_id(1)).await.unwrap(), Some(rider));
        assert_eq!(registry.find(&fixtures::rider_id(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn register_twice_fails_without_overwrite() {
        let registry = InMemoryRiderRegistry::new();
        let id = fixtures::rider_id(1);
        registry.register(&id, &fixtures::name("John Doe"), Tier::Bronze).await.unwrap();
        let err = registry
            .register(&id, &fixtures::name("Other Person"), Tier::Gold)
            .await
            .unwrap_err();
        assert_eq!(err, LoyaltyError::AlreadyExists(id.clone()));
        assert_eq!(registry.get(&id).unwrap().status, Tier::Bronze);
    }

    #[tokio::test]
    async fn set_status_requires_existing_rider() {
        let registry = InMemoryRiderRegistry::new();
        let err = registry
            .set_status(&fixtures::rider_id(1), Tier::Gold)
            .await
            .unwrap_err();
        assert_eq!(err, LoyaltyError::NotFound(fixtures::rider_id(1)));
    }

    #[tokio::test]
    async fn compare_and_set_only_writes_on_match() {
        let registry = InMemoryRiderRegistry::new();
        let id = fixtures::rider_id(1);
        registry.register(&id, &fixtures::name("John Doe"), Tier::Bronze).await.unwrap();

        assert!(!registry.compare_and_set_status(&id, Tier::Silver, Tier::Gold).await.unwrap());
        assert_eq!(registry.get(&id).unwrap().status, Tier::Bronze);
        assert!(registry.compare_and_set_status(&id, Tier::Bronze, Tier::Silver).await.unwrap());
        assert_eq!(registry.get(&id).unwrap().status, Tier::Silver);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let registry = InMemoryRiderRegistry::new();
        let id = fixtures::rider_id(1);
        registry.register(&id, &fixtures::name("John Doe"), Tier::Bronze).await.unwrap();
        registry.fail_status_writes(1);

        assert!(registry.set_status(&id, Tier::Gold).await.is_err());
        assert!(registry.set_status(&id, Tier::Gold).await.is_ok());
    }

    #[tokio::test]
    async fn record_defaults_finish_time_and_rejects_duplicates() {
        let ledger = InMemoryRideLedger::new();
        let ride = ledger.record(new_ride(1, 1)).await.unwrap();
        assert_eq!(ride.finished_at, test_clock().now());
        assert_eq!(ride.loyalty_points, 15);

        let err = ledger.record(new_ride(1, 1)).await.unwrap_err();
        assert_eq!(err, LoyaltyError::DuplicateRide(fixtures::ride_id(1)));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn counts_and_sums_per_rider() {
        let ledger = InMemoryRideLedger::new();
        ledger.record(new_ride(1, 1)).await.unwrap();
        ledger.record(new_ride(2, 1)).await.unwrap();
        ledger.record(new_ride(3, 2)).await.unwrap();

        assert_eq!(ledger.count_for_rider(&fixtures::rider_id(1)).await.unwrap(), 2);
        assert_eq!(ledger.points_for_rider(&fixtures::rider_id(1)).await.unwrap(), 30);
        assert_eq!(ledger.count_for_rider(&fixtures::rider_id(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_applies_filter_and_projection() {
        let ledger = InMemoryRideLedger::new();
        ledger.record(new_ride(1, 1)).await.unwrap();
        ledger.record(new_ride(2, 2)).await.unwrap();

        let found = ledger
            .find(
                &RideFilter::for_rider(fixtures::rider_id(2)),
                &RideProjection::only([RideField::LoyaltyPoints]),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, fixtures::ride_id(2));
        assert_eq!(found[0].loyalty_points, Some(15));
        assert_eq!(found[0].rider_id, None);

        assert!(ledger.contains(&fixtures::ride_id(1)).await.unwrap());
        assert!(!ledger.contains(&fixtures::ride_id(9)).await.unwrap());
    }
}
