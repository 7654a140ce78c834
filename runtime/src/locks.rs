//! Per-rider mutual exclusion.
//!
//! Every completion for a rider runs its duplicate check, rider check, ride
//! insert and tier write-back while holding that rider's lock. Different
//! riders never contend. Entries are removed once the last holder or waiter
//! is gone, so the map only holds riders with work in flight.

use loyalty_core::RiderId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<RiderId, Arc<tokio::sync::Mutex<()>>>;

/// Async mutex per rider id.
#[derive(Clone, Default)]
pub struct RiderLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl RiderLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and takes the lock of `rider_id`.
    pub async fn lock(&self, rider_id: &RiderId) -> RiderGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(rider_id.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        RiderGuard {
            rider_id: rider_id.clone(),
            table: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Number of riders with a lock held or awaited.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held lock of one rider. Released on drop.
pub struct RiderGuard {
    rider_id: RiderId,
    table: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RiderGuard {
    /// Rider this guard serializes.
    #[must_use]
    pub const fn rider_id(&self) -> &RiderId {
        &self.rider_id
    }
}

impl Drop for RiderGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if map
            .get(&self.rider_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            map.remove(&self.rider_id);
        }
    }
}
