//! Message bus abstraction the worker consumes from.
//!
//! The bus delivers raw [`BusMessage`]s with at-least-once semantics: a message
//! may arrive more than once, and a message whose processing fails may be
//! redelivered. Everything downstream of the bus must therefore be idempotent.
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: duplicates are expected and harmless
//! - **Explicit acknowledgement**: a message is settled only when its consumer
//!   calls [`BusMessage::ack`] after handling it; unsettled messages may be
//!   delivered again
//! - **Routing keys**: one topic per event family (`rider.signup`, `ride.completed`)
//! - **Ordered within partition**: messages published with the same key keep
//!   their relative order
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `loyalty-testing`, for tests
//! - `RedpandaEventBus` in `loyalty-redpanda`, Kafka-compatible, for production

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Settles a delivered message with the bus that delivered it.
///
/// Bus implementations tolerate repeated acknowledgement of one delivery.
#[derive(Clone)]
pub struct Acknowledger(Arc<dyn Fn() + Send + Sync>);

impl Acknowledger {
    /// Wraps the bus-specific settle action.
    #[must_use]
    pub fn new(ack: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(ack))
    }

    /// Runs the settle action.
    pub fn acknowledge(&self) {
        (self.0)();
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acknowledger")
    }
}

/// A raw message as delivered by the bus.
///
/// Equality compares routing key, key and payload only; the delivery handle
/// is not part of a message's identity.
#[derive(Clone, Debug)]
pub struct BusMessage {
    /// Routing key (topic) the message was published on.
    pub routing_key: String,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Raw body, expected to be a JSON envelope.
    pub payload: Vec<u8>,
    ack: Option<Acknowledger>,
}

impl BusMessage {
    /// Creates an unkeyed message.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            key: None,
            payload: payload.into(),
            ack: None,
        }
    }

    /// Sets the partition key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attaches the handle that settles this delivery. Set by bus implementations.
    #[must_use]
    pub fn with_ack(mut self, ack: Acknowledger) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Marks the message as fully handled. No-op for messages that were not
    /// delivered by a bus.
    pub fn ack(&self) {
        if let Some(ack) = &self.ack {
            ack.acknowledge();
        }
    }
}

impl PartialEq for BusMessage {
    fn eq(&self, other: &Self) -> bool {
        self.routing_key == other.routing_key
            && self.key == other.key
            && self.payload == other.payload
    }
}

impl Eq for BusMessage {}

/// Stream of messages from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BusMessage, EventBusError>> + Send>>;

/// Publish/subscribe transport.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`), which is how the worker
/// holds its bus.
pub trait EventBus: Send + Sync {
    /// Publish a message on its routing key.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more routing keys and receive a stream of messages.
    ///
    /// Yielded messages carry an [`Acknowledger`]. An implementation backed
    /// by a durable log commits its position only past messages that were
    /// acknowledged, so anything still in flight when the process dies is
    /// delivered again.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
