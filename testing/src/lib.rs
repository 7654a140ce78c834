//! # Loyalty Testing
//!
//! Testing utilities for the rider loyalty ledger.
//!
//! This crate provides:
//! - In-memory implementations of the store, bus and dead-letter traits,
//!   with failure injection
//! - A fixed clock
//! - Id, event and message fixtures
//! - proptest strategies for domain values
//!
//! ## Example
//!
//! ```
//! use loyalty_testing::{InMemoryRiderRegistry, fixtures};
//! use loyalty_core::store::RiderRegistry;
//! use loyalty_core::Tier;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = InMemoryRiderRegistry::new();
//! registry
//!     .register(&fixtures::rider_id(1), &fixtures::name("John Doe"), Tier::Bronze)
//!     .await?;
//! assert_eq!(registry.len(), 1);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use loyalty_core::environment::Clock;

mod dead_letters;
mod event_bus;
mod stores;

pub use dead_letters::InMemoryDeadLetters;
pub use event_bus::InMemoryEventBus;
pub use stores::{InMemoryRideLedger, InMemoryRiderRegistry};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use loyalty_testing::mocks::FixedClock;
    /// use loyalty_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Ids, events and raw bus messages for tests.
pub mod fixtures {
    #![allow(clippy::unwrap_used)] // Fixtures are built from known-good literals

    use loyalty_core::event::{COMPLETION_ROUTING_KEY, SIGNUP_ROUTING_KEY, SignupEvent};
    use loyalty_core::event_bus::BusMessage;
    use loyalty_core::{RideId, RiderId, RiderName};
    use serde_json::json;

    /// Rider id number `n`, zero-padded to 24 hex characters.
    #[must_use]
    pub fn rider_id(n: u32) -> RiderId {
        RiderId::parse(&format!("{n:024x}")).unwrap()
    }

    /// Ride id number `n`, zero-padded to 24 hex characters.
    #[must_use]
    pub fn ride_id(n: u32) -> RideId {
        RideId::parse(&format!("{n:024x}")).unwrap()
    }

    /// A display name.
    ///
    /// # Panics
    ///
    /// If `name` is shorter than 6 characters.
    #[must_use]
    pub fn name(name: &str) -> RiderName {
        RiderName::parse(name).unwrap()
    }

    /// A validated signup event.
    #[must_use]
    pub fn signup(rider: u32, display_name: &str) -> SignupEvent {
        SignupEvent {
            event_type: "rider_signup".to_string(),
            rider_id: rider_id(rider),
            name: name(display_name),
        }
    }

    /// Raw `rider.signup` message. The name is not validated.
    #[must_use]
    pub fn signup_message(rider: u32, display_name: &str) -> BusMessage {
        let body = json!({
            "type": "rider_signup",
            "payload": { "id": rider_id(rider).as_str(), "name": display_name }
        });
        BusMessage::new(SIGNUP_ROUTING_KEY, serde_json::to_vec(&body).unwrap())
            .with_key(rider_id(rider).as_str())
    }

    /// Raw `ride.completed` message. The amount is not validated.
    #[must_use]
    pub fn completion_message(ride: u32, rider: u32, amount: f64) -> BusMessage {
        let body = json!({
            "type": "ride_completed",
            "payload": {
                "id": ride_id(ride).as_str(),
                "rider_id": rider_id(rider).as_str(),
                "amount": amount
            }
        });
        BusMessage::new(COMPLETION_ROUTING_KEY, serde_json::to_vec(&body).unwrap())
            .with_key(rider_id(rider).as_str())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use loyalty_core::{Amount, Tier};
    use proptest::prelude::*;

    /// Any tier.
    pub fn tier() -> impl Strategy<Value = Tier> {
        prop::sample::select(Tier::ALL.to_vec())
    }

    /// Amounts from 0.00 to 10 000.00.
    pub fn amount() -> impl Strategy<Value = Amount> {
        (0u64..=1_000_000).prop_map(Amount::from_cents)
    }

    /// Decimal amounts with at most two fractional digits.
    pub fn decimal_amount() -> impl Strategy<Value = f64> {
        (0u32..=1_000_000).prop_map(|cents| f64::from(cents) / 100.0)
    }
}

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
