//! Validation and dispatch of raw bus messages.

use crate::coordinator::{CompletionCoordinator, CompletionOutcome, SignupCoordinator};
use loyalty_core::event::{EventKind, LoyaltyEvent};
use loyalty_core::event_bus::BusMessage;
use loyalty_core::store::{RideLedger, RiderRegistry};
use loyalty_core::{EventError, LoyaltyError, Rider, TierTable};
use std::collections::HashMap;
use std::sync::Arc;

/// What a successfully handled message did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A signup registered a rider.
    RiderRegistered(Rider),
    /// A completion recorded a ride.
    RideRecorded(CompletionOutcome),
}

/// Entry point for bus messages.
///
/// Messages are routed by topic. The default topics are `rider.signup` and
/// `ride.completed`; [`EventIngress::with_topic`] moves an event kind onto a
/// different topic. A malformed body or an unrouted topic fails
/// [`LoyaltyError::Validation`] before any store is touched.
#[derive(Clone)]
pub struct EventIngress {
    routes: HashMap<String, EventKind>,
    signup: SignupCoordinator,
    completion: CompletionCoordinator,
}

impl EventIngress {
    /// Wires both coordinators over the given stores.
    #[must_use]
    pub fn new(
        registry: Arc<dyn RiderRegistry>,
        ledger: Arc<dyn RideLedger>,
        tiers: Arc<TierTable>,
    ) -> Self {
        let signup = SignupCoordinator::new(Arc::clone(&registry), Arc::clone(&tiers));
        let completion = CompletionCoordinator::new(registry, ledger, tiers);
        Self::from_coordinators(signup, completion)
    }

    /// Uses pre-built coordinators.
    #[must_use]
    pub fn from_coordinators(signup: SignupCoordinator, completion: CompletionCoordinator) -> Self {
        let routes = [EventKind::Signup, EventKind::Completion]
            .into_iter()
            .map(|kind| (kind.routing_key().to_string(), kind))
            .collect();
        Self {
            routes,
            signup,
            completion,
        }
    }

    /// Consumes `kind` from `topic` instead of its current topic.
    #[must_use]
    pub fn with_topic(mut self, kind: EventKind, topic: impl Into<String>) -> Self {
        self.routes.retain(|_, routed| *routed != kind);
        self.routes.insert(topic.into(), kind);
        self
    }

    /// Topics this ingress accepts.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// The completion coordinator, for out-of-band reconciliation.
    #[must_use]
    pub const fn completion(&self) -> &CompletionCoordinator {
        &self.completion
    }

    /// Validates and handles one message.
    ///
    /// # Errors
    ///
    /// An [`EventError`] carrying the routing key, whatever ids the body
    /// contained, the completion stage reached and the typed failure.
    pub async fn dispatch(&self, message: &BusMessage) -> Result<Outcome, EventError> {
        let routing_key = message.routing_key.as_str();
        let kind = self.routes.get(routing_key).copied().ok_or_else(|| {
            EventError::new(
                routing_key,
                LoyaltyError::Validation(format!("no handler for routing key '{routing_key}'")),
            )
        })?;

        match LoyaltyEvent::parse_as(kind, routing_key, &message.payload)? {
            LoyaltyEvent::Signup(event) => self
                .signup
                .handle(&event)
                .await
                .map(Outcome::RiderRegistered)
                .map_err(|source| {
                    EventError::new(routing_key, source)
                        .with_event_type(event.event_type.as_str())
                        .with_rider(event.rider_id.as_str())
                }),
            LoyaltyEvent::Completion(event) => self
                .completion
                .handle(&event)
                .await
                .map(Outcome::RideRecorded)
                .map_err(|failure| {
                    EventError::new(routing_key, failure.source)
                        .with_event_type(event.event_type.as_str())
                        .with_rider(event.rider_id.as_str())
                        .with_ride(event.ride_id.as_str())
                        .at_stage(failure.stage)
                }),
        }
    }
}
