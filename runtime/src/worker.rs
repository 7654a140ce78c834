//! The loyalty worker: a bus consumer that feeds [`EventIngress`].
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! start: subscribe(topics)
//! loop {
//!     acquire prefetch permit
//!     next message ─► spawn task:
//!         attempt 1..=max_attempts:
//!             dispatch (bounded by task timeout)
//!             retryable failure ─► backoff, redeliver
//!         exhausted ─► drop | park
//!         publish TaskReport
//!         ack message
//!     stream ended ─► wait, resubscribe
//!     shutdown ─► drain in-flight tasks (bounded by exit timeout)
//! }
//! ```
//!
//! A timed-out attempt is not cancelled: it keeps running in the background
//! and the next attempt queues behind it on the rider's lock.
//!
//! Messages abandoned at the exit timeout are never acknowledged, so the bus
//! delivers them again.

use crate::ingress::{EventIngress, Outcome};
use crate::metrics::LoyaltyMetrics;
use crate::redelivery::{FinalDisposition, RedeliveryPolicy, retry_with_predicate};
use futures::StreamExt;
use loyalty_core::dead_letter::{DeadLetterSink, ParkedEvent};
use loyalty_core::environment::{Clock, SystemClock};
use loyalty_core::event_bus::{BusMessage, EventBus, EventBusError, EventStream};
use loyalty_core::{EventError, FailureKind, LoyaltyError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Worker errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// `start` called twice.
    #[error("worker '{0}' is already running")]
    AlreadyRunning(String),

    /// Initial subscription failed.
    #[error("worker subscription failed: {0}")]
    Subscribe(#[from] EventBusError),
}

/// Worker tuning.
///
/// # Default Values
///
/// - `name`: `loyaltyWorker`
/// - `prefetch`: 100
/// - `task_timeout`: 30 seconds
/// - `exit_timeout`: 3 seconds
/// - `reconnect_delay`: 5 seconds
/// - `redelivery`: [`RedeliveryPolicy::default`]
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used in logs.
    pub name: String,
    /// Maximum messages processed concurrently.
    pub prefetch: usize,
    /// Budget for a single attempt.
    pub task_timeout: Duration,
    /// Budget for draining in-flight tasks on stop.
    pub exit_timeout: Duration,
    /// Delay before resubscribing after the stream ends.
    pub reconnect_delay: Duration,
    /// Redelivery of retryable failures.
    pub redelivery: RedeliveryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "loyaltyWorker".to_string(),
            prefetch: 100,
            task_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

/// How a message ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Handled successfully.
    Completed(Outcome),
    /// Last attempt failed.
    Failed {
        /// The final error.
        error: EventError,
        /// Whether the event was stored in the dead-letter sink.
        parked: bool,
    },
}

/// Published once per message after its final attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    /// Routing key of the message.
    pub routing_key: String,
    /// Attempts made.
    pub attempts: u32,
    /// Result.
    pub status: TaskStatus,
}

impl TaskReport {
    /// Whether the message was handled successfully.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed(_))
    }

    /// Failure kind, if the message failed.
    #[must_use]
    pub const fn failure(&self) -> Option<FailureKind> {
        match &self.status {
            TaskStatus::Completed(_) => None,
            TaskStatus::Failed { error, .. } => Some(error.kind()),
        }
    }
}

struct WorkerInner {
    config: WorkerConfig,
    ingress: EventIngress,
    bus: Arc<dyn EventBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    reports: broadcast::Sender<TaskReport>,
}

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Long-running consumer service with explicit `start` / `stop`.
pub struct LoyaltyWorker {
    inner: Arc<WorkerInner>,
    running: Mutex<Option<Running>>,
}

impl LoyaltyWorker {
    /// Creates a stopped worker.
    #[must_use]
    pub fn new(
        ingress: EventIngress,
        bus: Arc<dyn EventBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: WorkerConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(config.prefetch.max(16) * 4);
        Self {
            inner: Arc::new(WorkerInner {
                config,
                ingress,
                bus,
                dead_letters,
                clock: Arc::new(SystemClock),
                reports,
            }),
            running: Mutex::new(None),
        }
    }

    /// Replaces the clock used for dead-letter timestamps.
    ///
    /// Call before [`LoyaltyWorker::start`].
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.clock = clock;
        }
        self
    }

    /// Receives a [`TaskReport`] for every message handled after this call.
    #[must_use]
    pub fn subscribe_reports(&self) -> broadcast::Receiver<TaskReport> {
        self.inner.reports.subscribe()
    }

    /// Whether the consumer loop is running.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Subscribes to the ingress topics and spawns the consumer loop.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::AlreadyRunning`] if already started
    /// - [`WorkerError::Subscribe`] if the initial subscription fails
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WorkerError::AlreadyRunning(self.inner.config.name.clone()));
        }

        let topics = self.inner.ingress.topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let stream = self.inner.bus.subscribe(&topic_refs).await?;
        info!(worker = %self.inner.config.name, topics = ?topics, "Subscribed to event bus");

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(stream, shutdown_rx).await });
        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Stops consuming and waits for in-flight messages, up to the exit timeout.
    ///
    /// Stopping a stopped worker is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        info!(worker = %self.inner.config.name, "Stopping worker");
        let _ = running.shutdown.send(());
        if let Err(e) = running.handle.await {
            error!(worker = %self.inner.config.name, error = %e, "Worker loop terminated abnormally");
        }
        info!(worker = %self.inner.config.name, "Worker stopped");
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>, mut stream: EventStream, mut shutdown: broadcast::Receiver<()>) {
        let name = self.config.name.clone();
        info!(worker = %name, prefetch = self.config.prefetch, "Worker started");

        let permits = Arc::new(Semaphore::new(self.config.prefetch.max(1)));
        let mut tasks = JoinSet::new();

        'consume: loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!(worker = %name, error = %e, "Message task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.recv() => break 'consume,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'consume,
                },
            };

            tokio::select! {
                _ = shutdown.recv() => break 'consume,
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let inner = Arc::clone(&self);
                        tasks.spawn(async move {
                            let _permit = permit;
                            inner.process(message).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(worker = %name, error = %e, "Error receiving message from stream");
                    }
                    None => {
                        warn!(worker = %name, "Event stream ended, reconnecting in {:?}", self.config.reconnect_delay);
                        match self.resubscribe(&mut shutdown).await {
                            Some(next_stream) => stream = next_stream,
                            None => break 'consume,
                        }
                    }
                },
            }
        }

        info!(worker = %name, in_flight = tasks.len(), "Worker received shutdown signal");
        let drain = async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!(worker = %name, error = %e, "Message task panicked");
                }
            }
        };
        if tokio::time::timeout(self.config.exit_timeout, drain).await.is_err() {
            warn!(
                worker = %name,
                abandoned = tasks.len(),
                "Exit timeout elapsed, abandoning in-flight messages"
            );
            tasks.abort_all();
        }
        info!(worker = %name, "Worker loop exited");
    }

    async fn resubscribe(&self, shutdown: &mut broadcast::Receiver<()>) -> Option<EventStream> {
        let topics = self.ingress.topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return None,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            match self.bus.subscribe(&topic_refs).await {
                Ok(stream) => {
                    info!(worker = %self.config.name, topics = ?topics, "Resubscribed to event bus");
                    return Some(stream);
                }
                Err(e) => {
                    error!(
                        worker = %self.config.name,
                        error = %e,
                        "Failed to subscribe to event bus, retrying in {:?}",
                        self.config.reconnect_delay
                    );
                }
            }
        }
    }

    async fn process(&self, message: BusMessage) {
        let started = Instant::now();
        LoyaltyMetrics::record_received(&message.routing_key);

        let attempted = retry_with_predicate(
            &self.config.redelivery,
            |attempt| {
                if attempt > 1 {
                    LoyaltyMetrics::record_redelivery();
                }
                self.attempt(&message, attempt)
            },
            EventError::is_retryable,
        )
        .await;

        let status = match attempted.result {
            Ok(outcome) => {
                debug!(routing_key = %message.routing_key, attempts = attempted.attempts, "Message handled");
                TaskStatus::Completed(outcome)
            }
            Err(error) => {
                LoyaltyMetrics::record_failure(error.kind());
                let parked = self.dispose(&message, &error, attempted.attempts).await;
                TaskStatus::Failed { error, parked }
            }
        };

        LoyaltyMetrics::record_duration(started.elapsed());
        let _ = self.reports.send(TaskReport {
            routing_key: message.routing_key.clone(),
            attempts: attempted.attempts,
            status,
        });
        message.ack();
    }

    async fn attempt(&self, message: &BusMessage, attempt: u32) -> Result<Outcome, EventError> {
        let ingress = self.ingress.clone();
        let owned = message.clone();
        let mut task = tokio::spawn(async move { ingress.dispatch(&owned).await });

        match tokio::time::timeout(self.config.task_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(EventError::new(
                message.routing_key.as_str(),
                LoyaltyError::Persistence(format!("task failed: {join_error}")),
            )),
            Err(_) => {
                warn!(
                    routing_key = %message.routing_key,
                    attempt,
                    timeout_ms = u64::try_from(self.config.task_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Task timed out"
                );
                Err(EventError::new(
                    message.routing_key.as_str(),
                    LoyaltyError::Persistence(format!(
                        "task timed out after {:?}",
                        self.config.task_timeout
                    )),
                ))
            }
        }
    }

    /// Applies the final disposition. Returns whether the event was parked.
    async fn dispose(&self, message: &BusMessage, error: &EventError, attempts: u32) -> bool {
        let routing_key = message.routing_key.as_str();
        let ride_id = error.ride_id.as_deref().unwrap_or_default();
        let rider_id = error.rider_id.as_deref().unwrap_or_default();
        let stage = error.stage.map(|s| s.as_str()).unwrap_or_default();

        match error.kind() {
            FailureKind::Validation => {
                error!(routing_key, ride_id, rider_id, error = %error.source, "Invalid message dropped");
                return false;
            }
            FailureKind::AlreadyExists | FailureKind::DuplicateRide | FailureKind::NotFound => {
                warn!(routing_key, ride_id, rider_id, error = %error.source, "Message dropped");
                return false;
            }
            FailureKind::UnknownRider | FailureKind::Persistence => {}
        }

        match self.config.redelivery.exhausted {
            FinalDisposition::Drop => {
                error!(
                    routing_key, ride_id, rider_id, stage, attempts,
                    error = %error.source,
                    "Redelivery exhausted, message dropped"
                );
                false
            }
            FinalDisposition::Park => {
                let parked =
                    ParkedEvent::from_failure(error, message.payload.clone(), attempts, self.clock.now());
                match self.dead_letters.park(parked).await {
                    Ok(()) => {
                        LoyaltyMetrics::record_parked();
                        warn!(
                            routing_key, ride_id, rider_id, stage, attempts,
                            error = %error.source,
                            "Redelivery exhausted, message parked"
                        );
                        true
                    }
                    Err(park_error) => {
                        error!(
                            routing_key, ride_id, rider_id, stage, attempts,
                            error = %error.source,
                            park_error = %park_error,
                            "Redelivery exhausted and parking failed, message dropped"
                        );
                        false
                    }
                }
            }
        }
    }
}
