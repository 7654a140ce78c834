//! Storage abstractions for riders and rides.
//!
//! Both stores are idempotent at their keys: a second `register` for the same
//! rider id fails [`LoyaltyError::AlreadyExists`], a second `record` for the
//! same ride id fails [`LoyaltyError::DuplicateRide`], and neither leaves a
//! partial write behind. Backend failures map to
//! [`LoyaltyError::Persistence`].
//!
//! # Dyn Compatibility
//!
//! Like [`EventBus`](crate::event_bus::EventBus), these traits return
//! `Pin<Box<dyn Future>>` so coordinators can hold `Arc<dyn RiderRegistry>` and
//! `Arc<dyn RideLedger>`.

use crate::error::LoyaltyError;
use crate::model::{NewRide, ProjectedRide, Ride, RideFilter, RideProjection, Rider};
use crate::tier::Tier;
use crate::types::{RideId, RiderId, RiderName};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LoyaltyError>> + Send + 'a>>;

/// Store of riders.
pub trait RiderRegistry: Send + Sync {
    /// Registers a rider at `status`, stamping `created_at` from the
    /// registry's clock.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::AlreadyExists`] if the id is taken
    /// - [`LoyaltyError::Persistence`] on backend failure
    fn register(&self, id: &RiderId, name: &RiderName, status: Tier) -> StoreFuture<'_, Rider>;

    /// Looks a rider up by id.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn find(&self, id: &RiderId) -> StoreFuture<'_, Option<Rider>>;

    /// Overwrites the rider's status.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::NotFound`] if the rider does not exist
    /// - [`LoyaltyError::Persistence`] on backend failure
    fn set_status(&self, id: &RiderId, status: Tier) -> StoreFuture<'_, ()>;

    /// Writes `new` only if the stored status equals `expected`. Returns
    /// whether the write happened.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::NotFound`] if the rider does not exist
    /// - [`LoyaltyError::Persistence`] on backend failure
    fn compare_and_set_status(
        &self,
        id: &RiderId,
        expected: Tier,
        new: Tier,
    ) -> StoreFuture<'_, bool>;
}

/// Append-only store of completed rides.
pub trait RideLedger: Send + Sync {
    /// Appends a ride. Rider existence is the caller's responsibility.
    ///
    /// Returns the stored record, with `finished_at` defaulted from the
    /// ledger's clock when absent.
    ///
    /// # Errors
    ///
    /// - [`LoyaltyError::DuplicateRide`] if the id is already recorded
    /// - [`LoyaltyError::Persistence`] on backend failure
    fn record(&self, ride: NewRide) -> StoreFuture<'_, Ride>;

    /// Looks a ride up by id, returning the projected fields.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn find_by_id(
        &self,
        id: &RideId,
        projection: &RideProjection,
    ) -> StoreFuture<'_, Option<ProjectedRide>>;

    /// Lists rides matching `filter`, ordered by `finished_at` then id.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn find(
        &self,
        filter: &RideFilter,
        projection: &RideProjection,
    ) -> StoreFuture<'_, Vec<ProjectedRide>>;

    /// Number of rides recorded for a rider. Reflects every `record` that has
    /// returned.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn count_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64>;

    /// Sum of loyalty points over a rider's rides.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn points_for_rider(&self, rider_id: &RiderId) -> StoreFuture<'_, u64>;

    /// Whether a ride with this id is recorded.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on backend failure.
    fn contains(&self, id: &RideId) -> StoreFuture<'_, bool> {
        let lookup = self.find_by_id(id, &RideProjection::id_only());
        Box::pin(async move { Ok(lookup.await?.is_some()) })
    }
}
