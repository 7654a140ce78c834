//! Redpanda event bus for the rider loyalty ledger.
//!
//! This crate provides a Kafka-compatible [`EventBus`] built on rdkafka. Topics
//! are the routing keys (`rider.signup`, `ride.completed`), payloads are the
//! raw JSON envelopes, and messages are keyed by rider id so that every event
//! of a rider lands on the same partition.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only AFTER the subscriber acknowledges the message
//!   ([`BusMessage::ack`]), never on hand-off
//! - Messages acknowledged out of order are committed up to the lowest offset
//!   still in flight on their partition
//! - If the process crashes before commit, the message is redelivered
//! - Handlers downstream must be idempotent (ride and rider ids are)
//! - Ordering is guaranteed within a partition, hence per rider
//!
//! **Configuration options**:
//! - `consumer_group`: Explicit consumer group for load balancing
//! - `buffer_size`: Message buffer (default: 1000) for handling bursts
//! - `auto_offset_reset`: Where to start reading (default: "latest")
//!
//! # Example
//!
//! ```no_run
//! use loyalty_redpanda::RedpandaEventBus;
//! use loyalty_core::event_bus::{BusMessage, EventBus};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("loyalty-worker")
//!     .build()?;
//!
//! let mut stream = event_bus.subscribe(&["rider.signup", "ride.completed"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(message) => println!("Received on {}", message.routing_key),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod offsets;

use loyalty_core::event_bus::{Acknowledger, BusMessage, EventBus, EventBusError, EventStream};
use offsets::OffsetTracker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a closed subscription keeps committing acknowledgements of
/// messages that were still being processed.
const ACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// An acknowledged delivery: topic, partition, offset.
type Settled = (String, i32, i64);

/// Redpanda event bus implementation.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or derived from the subscribed topics
/// - **Buffer size**: Message buffer capacity (default: 1000)
/// - **Offset reset**: Where new groups start reading (default: "latest")
///
/// # Example
///
/// ```no_run
/// use loyalty_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used for a subscription to `topics`.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("loyalty-{}", sorted.join("-"))
        })
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4" or "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// Every worker instance sharing a group splits the partitions between
    /// them. If not set, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the message buffer size between the Kafka consumer and the subscriber.
    ///
    /// A zero size is raised to 1.
    ///
    /// Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where new consumer groups start reading: "earliest", "latest" or "error".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set("compression.type", self.compression.as_deref().unwrap_or("none"));

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest"),
            "RedpandaEventBus created successfully"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
        })
    }
}

/// Converts a received Kafka message. A message without a body is delivered
/// with an empty payload so that ingress rejects it as malformed.
fn to_bus_message(message: &BorrowedMessage<'_>) -> BusMessage {
    let bus_message = BusMessage::new(message.topic(), message.payload().unwrap_or_default());
    match message.key() {
        Some(key) => bus_message.with_key(String::from_utf8_lossy(key)),
        None => bus_message,
    }
}

/// Commits `next` as the position to resume `topic`/`partition` from.
fn commit_position(consumer: &StreamConsumer, topic: &str, partition: i32, next: i64) {
    let mut positions = TopicPartitionList::new();
    let committed = positions
        .add_partition_offset(topic, partition, Offset::Offset(next))
        .and_then(|()| consumer.commit(&positions, CommitMode::Async));

    match committed {
        Ok(()) => tracing::trace!(topic, partition, offset = next, "Committed offset"),
        Err(e) => tracing::warn!(
            topic,
            partition,
            offset = next,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        ),
    }
}

fn settle(
    consumer: &StreamConsumer,
    offsets: &mut OffsetTracker,
    (topic, partition, offset): Settled,
) {
    if let Some(next) = offsets.acknowledged(&topic, partition, offset) {
        commit_position(consumer, &topic, partition, next);
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let message = message.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let topic = message.routing_key.as_str();
            let mut record: FutureRecord<'_, str, Vec<u8>> =
                FutureRecord::to(topic).payload(&message.payload);
            if let Some(key) = message.key.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        key = message.key.as_deref().unwrap_or_default(),
                        "Message published successfully"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group_id = self.consumer_group_for(&topics);
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // Manual commit for at-least-once
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topic_refs).map_err(|e| {
                EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                }
            })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size = buffer_size,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topics"
            );

            let (tx, rx) = mpsc::channel(buffer_size);
            let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Settled>();

            // The task owns the consumer, forwards messages and commits the
            // positions their acknowledgements make safe.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                let mut offsets = OffsetTracker::default();

                loop {
                    tokio::select! {
                        Some(settled) = ack_rx.recv() => settle(&consumer, &mut offsets, settled),
                        () = tx.closed() => {
                            tracing::debug!("Channel receiver dropped, stopping consumption");
                            break;
                        }
                        next = stream.next() => match next {
                            Some(Ok(message)) => {
                                let topic = message.topic().to_string();
                                let partition = message.partition();
                                let offset = message.offset();
                                tracing::trace!(topic = %topic, partition, offset, "Received message");

                                offsets.delivered(&topic, partition, offset);
                                let acks = ack_tx.clone();
                                let delivery = to_bus_message(&message).with_ack(Acknowledger::new(
                                    move || {
                                        let _ = acks.send((topic.clone(), partition, offset));
                                    },
                                ));
                                if tx.send(Ok(delivery)).await.is_err() {
                                    tracing::debug!("Channel receiver dropped, stopping consumption");
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                let err = EventBusError::TransportError(format!(
                                    "Failed to receive message: {e}"
                                ));
                                if tx.send(Err(err)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }

                // Messages handed out before the subscriber went away may still
                // finish; commit their acknowledgements for a bounded time.
                drop(ack_tx);
                let drain = async {
                    while offsets.in_flight() > 0 {
                        match ack_rx.recv().await {
                            Some(settled) => settle(&consumer, &mut offsets, settled),
                            None => break,
                        }
                    }
                };
                if tokio::time::timeout(ACK_DRAIN_TIMEOUT, drain).await.is_err() {
                    tracing::warn!(
                        unacknowledged = offsets.in_flight(),
                        "Consumer closed with unacknowledged messages, they will be redelivered"
                    );
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}
