//! In-memory event bus.
//!
//! Every subscriber gets its own unbounded channel. A published message is
//! recorded and fanned out to each live subscriber whose topics contain its
//! routing key. Delivered messages record their acknowledgement so tests
//! can check when the consumer settled them.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use loyalty_core::event_bus::{Acknowledger, BusMessage, EventBus, EventBusError, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Delivery = Result<BusMessage, EventBusError>;

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    published: Vec<BusMessage>,
}

/// In-memory [`EventBus`] for tests.
///
/// Clones share the same subscribers and publish log.
///
/// # Example
///
/// ```
/// use loyalty_testing::{InMemoryEventBus, fixtures};
/// use loyalty_core::event_bus::EventBus;
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// let mut stream = bus.subscribe(&["rider.signup"]).await?;
///
/// bus.publish(&fixtures::signup_message(1, "John Doe")).await?;
/// let message = stream.next().await.unwrap()?;
/// assert_eq!(message.routing_key, "rider.signup");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    acknowledged: Arc<Mutex<Vec<BusMessage>>>,
    subscribe_failures: Arc<AtomicU32>,
    subscriptions: Arc<AtomicUsize>,
}

impl InMemoryEventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BusMessage> {
        self.state.lock().unwrap().published.clone()
    }

    /// Every acknowledged delivery, in acknowledgement order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<BusMessage> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// Number of subscribers whose stream is still open.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Number of successful `subscribe` calls so far.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Ends every open subscription stream.
    pub fn disconnect_all(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    /// Delivers a transport error to every live subscriber.
    pub fn inject_error(&self, reason: &str) {
        let state = self.state.lock().unwrap();
        for subscriber in &state.subscribers {
            let _ = subscriber
                .tx
                .send(Err(EventBusError::TransportError(reason.to_string())));
        }
    }

    /// Make the next `n` calls to `subscribe` fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let message = message.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.published.push(message.clone());
            state.subscribers.retain(|s| !s.tx.is_closed());
            for subscriber in &state.subscribers {
                if subscriber.topics.contains(&message.routing_key) {
                    let log = Arc::clone(&self.acknowledged);
                    let settled = message.clone();
                    let delivery = message.clone().with_ack(Acknowledger::new(move || {
                        log.lock().unwrap().push(settled.clone());
                    }));
                    let _ = subscriber.tx.send(Ok(delivery));
                }
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        Box::pin(async move {
            let failed = self
                .subscribe_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "injected subscribe failure".to_string(),
                });
            }

            let (tx, mut rx) = mpsc::unbounded_channel();
            self.state
                .lock()
                .unwrap()
                .subscribers
                .push(Subscriber { topics, tx });
            self.subscriptions.fetch_add(1, Ordering::SeqCst);

            let stream = async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield delivery;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
