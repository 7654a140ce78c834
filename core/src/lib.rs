//! # Loyalty Core
//!
//! Domain types and storage abstractions for the rider loyalty ledger.
//!
//! The ledger is driven by two asynchronous lifecycle events delivered over a
//! message bus with at-least-once semantics:
//!
//! - **Rider signup** (`rider.signup`): creates a rider at the lowest tier
//! - **Ride completion** (`ride.completed`): records a ride, awards points from
//!   the rider's tier at completion time and recomputes the tier
//!
//! ## Core Concepts
//!
//! - **Tier table**: ordered rules mapping a completed-ride count to a tier and
//!   a points multiplier ([`tier`])
//! - **Registry / Ledger**: idempotent stores for riders and rides ([`store`])
//! - **Events**: validated envelopes parsed from raw bus messages ([`event`])
//! - **Errors**: a closed taxonomy callers can match on for retry-vs-drop
//!   decisions ([`error`])
//!
//! ## Example
//!
//! ```
//! use loyalty_core::tier::{Tier, TierTable};
//!
//! let tiers = TierTable::standard();
//! assert_eq!(tiers.resolve_tier(0), Tier::Bronze);
//! assert_eq!(tiers.resolve_tier(20), Tier::Silver);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod dead_letter;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod model;
pub mod store;
pub mod tier;
pub mod types;

pub use error::{CompletionStage, EventError, FailureKind, LoyaltyError};
pub use model::{NewRide, ProjectedRide, Ride, RideField, RideFilter, RideProjection, Rider, RiderSummary};
pub use tier::{Tier, TierRule, TierTable};
pub use types::{Amount, RideId, RiderId, RiderName};

/// Environment module - injected dependencies.
///
/// All wall-clock reads go through [`Clock`](environment::Clock) so that
/// registries and ledgers can be driven by a fixed clock in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use loyalty_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
