//! Lifecycle events consumed by the ledger.
//!
//! Both events share one JSON envelope:
//!
//! ```json
//! { "type": "rider_signup", "payload": { "id": "<hex24>", "name": "John Doe" } }
//! { "type": "ride_completed", "payload": { "id": "<hex24>", "rider_id": "<hex24>", "amount": 20.0 } }
//! ```
//!
//! The routing key selects the payload schema. The `type` field is carried for
//! diagnostics only; it must be a non-empty string but its value does not
//! affect dispatch. Unknown fields are rejected at both levels.
//!
//! # Example
//!
//! ```
//! use loyalty_core::event::{LoyaltyEvent, SIGNUP_ROUTING_KEY};
//!
//! let raw = br#"{"type":"rider_signup","payload":{"id":"000000000000000000000001","name":"John Doe"}}"#;
//! let event = LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, raw).unwrap();
//! assert!(matches!(event, LoyaltyEvent::Signup(_)));
//! ```

use crate::error::{EventError, LoyaltyError};
use crate::event_bus::BusMessage;
use crate::types::{Amount, RideId, RiderId, RiderName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing key of rider signup events.
pub const SIGNUP_ROUTING_KEY: &str = "rider.signup";

/// Routing key of ride completion events.
pub const COMPLETION_ROUTING_KEY: &str = "ride.completed";

/// The two event families the ledger understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `rider.signup`
    Signup,
    /// `ride.completed`
    Completion,
}

impl EventKind {
    /// Maps a routing key to its event kind.
    #[must_use]
    pub fn from_routing_key(routing_key: &str) -> Option<Self> {
        match routing_key {
            SIGNUP_ROUTING_KEY => Some(Self::Signup),
            COMPLETION_ROUTING_KEY => Some(Self::Completion),
            _ => None,
        }
    }

    /// Default routing key of this kind.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        match self {
            Self::Signup => SIGNUP_ROUTING_KEY,
            Self::Completion => COMPLETION_ROUTING_KEY,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope<P> {
    #[serde(rename = "type")]
    event_type: String,
    payload: P,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    #[serde(rename = "type")]
    event_type: &'a str,
    payload: P,
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct SignupPayload {
    id: RiderId,
    name: RiderName,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CompletionPayload {
    id: RideId,
    rider_id: RiderId,
    amount: f64,
}

#[derive(Serialize)]
struct CompletionPayloadOut<'a> {
    id: &'a RideId,
    rider_id: &'a RiderId,
    amount: f64,
}

/// A validated `rider.signup` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignupEvent {
    /// Envelope `type`.
    pub event_type: String,
    /// New rider id.
    pub rider_id: RiderId,
    /// Display name.
    pub name: RiderName,
}

/// A validated `ride.completed` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Envelope `type`.
    pub event_type: String,
    /// Ride id.
    pub ride_id: RideId,
    /// Owning rider.
    pub rider_id: RiderId,
    /// Fare amount.
    pub amount: Amount,
}

/// A validated event ready for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoyaltyEvent {
    /// Rider signup.
    Signup(SignupEvent),
    /// Ride completion.
    Completion(CompletionEvent),
}

impl LoyaltyEvent {
    /// Validates a raw message body against the schema of `routing_key`.
    ///
    /// # Errors
    ///
    /// Always [`LoyaltyError::Validation`], wrapped with whatever ids could be
    /// read from the body: invalid JSON, unknown routing key, missing or
    /// unknown fields, malformed ids, short names, negative or imprecise
    /// amounts.
    pub fn parse(routing_key: &str, body: &[u8]) -> Result<Self, EventError> {
        let kind = EventKind::from_routing_key(routing_key).ok_or_else(|| {
            EventError::new(
                routing_key,
                LoyaltyError::Validation(format!("unknown routing key '{routing_key}'")),
            )
        })?;
        Self::parse_as(kind, routing_key, body)
    }

    /// Validates a raw message body against the schema of `kind`, for
    /// messages arriving on a topic other than the default routing key.
    ///
    /// # Errors
    ///
    /// Same as [`LoyaltyEvent::parse`], minus the routing key check.
    pub fn parse_as(kind: EventKind, routing_key: &str, body: &[u8]) -> Result<Self, EventError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            EventError::new(routing_key, LoyaltyError::Validation(format!("invalid JSON: {e}")))
        })?;
        let context = |source: LoyaltyError| with_context(kind, routing_key, &value, source);

        match kind {
            EventKind::Signup => {
                let envelope: Envelope<SignupPayload> = serde_json::from_value(value.clone())
                    .map_err(|e| context(LoyaltyError::Validation(e.to_string())))?;
                check_event_type(&envelope.event_type).map_err(&context)?;
                Ok(Self::Signup(SignupEvent {
                    event_type: envelope.event_type,
                    rider_id: envelope.payload.id,
                    name: envelope.payload.name,
                }))
            }
            EventKind::Completion => {
                let envelope: Envelope<CompletionPayload> = serde_json::from_value(value.clone())
                    .map_err(|e| context(LoyaltyError::Validation(e.to_string())))?;
                check_event_type(&envelope.event_type).map_err(&context)?;
                let amount = Amount::from_decimal(envelope.payload.amount)
                    .map_err(|e| context(e.into()))?;
                Ok(Self::Completion(CompletionEvent {
                    event_type: envelope.event_type,
                    ride_id: envelope.payload.id,
                    rider_id: envelope.payload.rider_id,
                    amount,
                }))
            }
        }
    }

    /// Event family.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Signup(_) => EventKind::Signup,
            Self::Completion(_) => EventKind::Completion,
        }
    }

    /// Owning rider.
    #[must_use]
    pub const fn rider_id(&self) -> &RiderId {
        match self {
            Self::Signup(event) => &event.rider_id,
            Self::Completion(event) => &event.rider_id,
        }
    }

    /// Serializes the event to a message on its default routing key, keyed by
    /// rider so all events of one rider share a partition.
    ///
    /// # Errors
    ///
    /// Returns [`LoyaltyError::Validation`] if the body cannot be serialized.
    pub fn to_bus_message(&self) -> Result<BusMessage, LoyaltyError> {
        let payload = match self {
            Self::Signup(event) => serde_json::to_vec(&EnvelopeRef {
                event_type: &event.event_type,
                payload: SignupPayload {
                    id: event.rider_id.clone(),
                    name: event.name.clone(),
                },
            }),
            Self::Completion(event) => serde_json::to_vec(&EnvelopeRef {
                event_type: &event.event_type,
                payload: CompletionPayloadOut {
                    id: &event.ride_id,
                    rider_id: &event.rider_id,
                    amount: event.amount.as_decimal(),
                },
            }),
        }
        .map_err(|e| LoyaltyError::Validation(e.to_string()))?;

        Ok(BusMessage::new(self.kind().routing_key(), payload)
            .with_key(self.rider_id().as_str()))
    }
}

fn check_event_type(event_type: &str) -> Result<(), LoyaltyError> {
    if event_type.trim().is_empty() {
        Err(LoyaltyError::Validation("event type must not be empty".to_string()))
    } else {
        Ok(())
    }
}

fn with_context(kind: EventKind, routing_key: &str, value: &Value, source: LoyaltyError) -> EventError {
    let mut error = EventError::new(routing_key, source);
    if let Some(event_type) = value.get("type").and_then(Value::as_str) {
        error = error.with_event_type(event_type);
    }
    let payload = value.get("payload");
    let field = |name: &str| payload.and_then(|p| p.get(name)).and_then(Value::as_str);
    match kind {
        EventKind::Signup => {
            if let Some(id) = field("id") {
                error = error.with_rider(id);
            }
        }
        EventKind::Completion => {
            if let Some(id) = field("id") {
                error = error.with_ride(id);
            }
            if let Some(id) = field("rider_id") {
                error = error.with_rider(id);
            }
        }
    }
    error
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn parses_signup() {
        let raw = body(&json!({
            "type": "rider_signup",
            "payload": { "id": "000000000000000000000001", "name": "John Doe" }
        }));
        let LoyaltyEvent::Signup(event) = LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).unwrap()
        else {
            unreachable!("expected signup");
        };
        assert_eq!(event.rider_id.as_str(), "000000000000000000000001");
        assert_eq!(event.name.as_str(), "John Doe");
    }

    #[test]
    fn parses_completion() {
        let raw = body(&json!({
            "type": "ride_completed",
            "payload": {
                "id": "00000000000000000000000a",
                "rider_id": "000000000000000000000001",
                "amount": 20.5
            }
        }));
        let LoyaltyEvent::Completion(event) =
            LoyaltyEvent::parse(COMPLETION_ROUTING_KEY, &raw).unwrap()
        else {
            unreachable!("expected completion");
        };
        assert_eq!(event.amount.cents(), 2050);
    }

    #[test]
    fn rejects_negative_amount_with_context() {
        let raw = body(&json!({
            "type": "ride_completed",
            "payload": {
                "id": "00000000000000000000000a",
                "rider_id": "000000000000000000000001",
                "amount": -2
            }
        }));
        let error = LoyaltyEvent::parse(COMPLETION_ROUTING_KEY, &raw).unwrap_err();
        assert_eq!(error.kind(), FailureKind::Validation);
        assert_eq!(error.ride_id.as_deref(), Some("00000000000000000000000a"));
        assert_eq!(error.rider_id.as_deref(), Some("000000000000000000000001"));
        assert_eq!(error.event_type.as_deref(), Some("ride_completed"));
    }

    #[test]
    fn rejects_short_name() {
        let raw = body(&json!({
            "type": "rider_signup",
            "payload": { "id": "000000000000000000000001", "name": "Jane" }
        }));
        let error = LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).unwrap_err();
        assert_eq!(error.kind(), FailureKind::Validation);
        assert_eq!(error.rider_id.as_deref(), Some("000000000000000000000001"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = body(&json!({
            "type": "rider_signup",
            "payload": { "id": "000000000000000000000001", "name": "John Doe", "extra": 1 }
        }));
        assert!(LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).is_err());

        let raw = body(&json!({
            "type": "rider_signup",
            "version": 2,
            "payload": { "id": "000000000000000000000001", "name": "John Doe" }
        }));
        assert!(LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).is_err());
    }

    #[test]
    fn rejects_missing_type_or_payload() {
        let raw = body(&json!({ "payload": { "id": "000000000000000000000001", "name": "John Doe" } }));
        assert!(LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).is_err());

        let raw = body(&json!({ "type": "rider_signup" }));
        assert!(LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).is_err());

        let raw = body(&json!({
            "type": "",
            "payload": { "id": "000000000000000000000001", "name": "John Doe" }
        }));
        assert!(LoyaltyEvent::parse(SIGNUP_ROUTING_KEY, &raw).is_err());
    }

    #[test]
    fn rejects_malformed_ids_and_json() {
        let raw = body(&json!({
            "type": "ride_completed",
            "payload": { "id": "ride-1", "rider_id": "000000000000000000000001", "amount": 3 }
        }));
        assert!(LoyaltyEvent::parse(COMPLETION_ROUTING_KEY, &raw).is_err());
        assert!(LoyaltyEvent::parse(COMPLETION_ROUTING_KEY, b"{not json").is_err());
    }

    #[test]
    fn rejects_unknown_routing_key() {
        let error = LoyaltyEvent::parse("ride.cancelled", b"{}").unwrap_err();
        assert_eq!(error.routing_key, "ride.cancelled");
        assert_eq!(error.kind(), FailureKind::Validation);
    }

    #[test]
    fn bus_message_round_trips_through_parse() {
        let event = LoyaltyEvent::Completion(CompletionEvent {
            event_type: "ride_completed".to_string(),
            ride_id: RideId::parse("00000000000000000000000a").unwrap(),
            rider_id: RiderId::parse("000000000000000000000001").unwrap(),
            amount: Amount::from_cents(1234),
        });
        let message = event.to_bus_message().unwrap();
        assert_eq!(message.routing_key, COMPLETION_ROUTING_KEY);
        assert_eq!(message.key.as_deref(), Some("000000000000000000000001"));
        assert_eq!(LoyaltyEvent::parse(&message.routing_key, &message.payload).unwrap(), event);
    }
}
