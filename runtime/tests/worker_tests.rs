//! End-to-end tests for the loyalty worker over the in-memory bus and stores.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use loyalty_core::event_bus::EventBus;
use loyalty_core::model::{Rider, RideFilter, RideProjection};
use loyalty_core::store::{RideLedger, RiderRegistry, StoreFuture};
use loyalty_core::{FailureKind, RiderId, RiderName, Tier, TierRule, TierTable};
use loyalty_runtime::{
    EventIngress, FinalDisposition, LoyaltyWorker, Outcome, RedeliveryPolicy, TaskReport, TaskStatus,
    WorkerConfig, WorkerError,
};
use loyalty_testing::{
    InMemoryDeadLetters, InMemoryEventBus, InMemoryRideLedger, InMemoryRiderRegistry, fixtures,
    init_test_tracing,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    registry: InMemoryRiderRegistry,
    ledger: InMemoryRideLedger,
    bus: InMemoryEventBus,
    dead_letters: InMemoryDeadLetters,
    worker: LoyaltyWorker,
    reports: broadcast::Receiver<TaskReport>,
}

impl Harness {
    fn new(disposition: FinalDisposition) -> Self {
        Self::build(
            InMemoryRiderRegistry::new(),
            None,
            TierTable::standard(),
            config(disposition),
        )
    }

    fn build(
        registry: InMemoryRiderRegistry,
        registry_override: Option<Arc<dyn RiderRegistry>>,
        tiers: TierTable,
        config: WorkerConfig,
    ) -> Self {
        init_test_tracing();
        let ledger = InMemoryRideLedger::new();
        let bus = InMemoryEventBus::new();
        let dead_letters = InMemoryDeadLetters::new();

        let registry_handle: Arc<dyn RiderRegistry> =
            registry_override.unwrap_or_else(|| Arc::new(registry.clone()));
        let ingress = EventIngress::new(registry_handle, Arc::new(ledger.clone()), Arc::new(tiers));
        let worker = LoyaltyWorker::new(
            ingress,
            Arc::new(bus.clone()),
            Arc::new(dead_letters.clone()),
            config,
        );
        let reports = worker.subscribe_reports();

        Self {
            registry,
            ledger,
            bus,
            dead_letters,
            worker,
            reports,
        }
    }

    async fn started(self) -> Self {
        tokio_test::assert_ok!(self.worker.start().await);
        self
    }

    async fn next_report(&mut self) -> TaskReport {
        tokio::time::timeout(REPORT_TIMEOUT, self.reports.recv())
            .await
            .expect("timed out waiting for a task report")
            .expect("report channel closed")
    }

    async fn signup(&mut self, rider: u32) -> TaskReport {
        self.bus
            .publish(&fixtures::signup_message(rider, "John Doe"))
            .await
            .unwrap();
        self.next_report().await
    }

    async fn complete(&mut self, ride: u32, rider: u32, amount: f64) -> TaskReport {
        self.bus
            .publish(&fixtures::completion_message(ride, rider, amount))
            .await
            .unwrap();
        self.next_report().await
    }
}

fn config(disposition: FinalDisposition) -> WorkerConfig {
    WorkerConfig {
        task_timeout: Duration::from_secs(2),
        exit_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(20),
        redelivery: RedeliveryPolicy::builder()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(20))
            .exhausted(disposition)
            .build(),
        ..WorkerConfig::default()
    }
}

fn recorded_points(report: &TaskReport) -> u64 {
    match &report.status {
        TaskStatus::Completed(Outcome::RideRecorded(outcome)) => outcome.ride.loyalty_points,
        other => panic!("expected a recorded ride, got {other:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(REPORT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn signup_then_completion_awards_points() {
    let mut h = Harness::new(FinalDisposition::Drop).started().await;

    let report = h.signup(1).await;
    assert!(report.is_completed());
    assert_eq!(report.attempts, 1);
    assert_eq!(h.registry.get(&fixtures::rider_id(1)).unwrap().status, Tier::Bronze);

    let report = h.complete(1, 1, 42.75).await;
    assert_eq!(report.routing_key, "ride.completed");
    assert_eq!(recorded_points(&report), 42);
    assert_eq!(h.ledger.len(), 1);

    h.worker.stop().await;
}

#[tokio::test]
async fn completion_before_signup_succeeds_on_redelivery() {
    let mut config = config(FinalDisposition::Drop);
    config.redelivery = RedeliveryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(300))
        .build();
    let mut h = Harness::build(InMemoryRiderRegistry::new(), None, TierTable::standard(), config)
        .started()
        .await;

    h.bus
        .publish(&fixtures::completion_message(1, 1, 10.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.bus
        .publish(&fixtures::signup_message(1, "John Doe"))
        .await
        .unwrap();

    let first = h.next_report().await;
    let second = h.next_report().await;
    let completion = [first, second]
        .into_iter()
        .find(|r| r.routing_key == "ride.completed")
        .unwrap();

    assert!(completion.is_completed());
    assert_eq!(completion.attempts, 2);
    assert_eq!(recorded_points(&completion), 10);

    h.worker.stop().await;
}

#[tokio::test]
async fn unknown_rider_is_dropped_after_redelivery() {
    let mut h = Harness::new(FinalDisposition::Drop).started().await;

    let report = h.complete(1, 9, 10.0).await;
    assert_eq!(report.attempts, 2);
    assert_eq!(report.failure(), Some(FailureKind::UnknownRider));
    assert!(matches!(report.status, TaskStatus::Failed { parked: false, .. }));
    assert!(h.dead_letters.is_empty());
    assert!(h.ledger.is_empty());

    h.worker.stop().await;
}

#[tokio::test]
async fn unknown_rider_is_parked_when_configured() {
    let mut h = Harness::new(FinalDisposition::Park).started().await;

    let report = h.complete(3, 9, 10.0).await;
    assert!(matches!(report.status, TaskStatus::Failed { parked: true, .. }));

    let parked = h.dead_letters.parked();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].failure, FailureKind::UnknownRider);
    assert_eq!(parked[0].attempts, 2);
    assert_eq!(parked[0].routing_key, "ride.completed");
    assert_eq!(parked[0].ride_id.as_deref(), Some(fixtures::ride_id(3).as_str()));
    assert_eq!(parked[0].payload, fixtures::completion_message(3, 9, 10.0).payload);

    h.worker.stop().await;
}

#[tokio::test]
async fn failed_parking_reports_unparked() {
    let mut h = Harness::new(FinalDisposition::Park).started().await;
    h.dead_letters.fail_next(1);

    let report = h.complete(1, 9, 10.0).await;
    assert!(matches!(report.status, TaskStatus::Failed { parked: false, .. }));
    assert!(h.dead_letters.is_empty());

    h.worker.stop().await;
}

#[tokio::test]
async fn validation_failures_are_not_redelivered() {
    let mut h = Harness::new(FinalDisposition::Park).started().await;
    h.signup(1).await;

    let report = h.complete(1, 1, -5.0).await;
    assert_eq!(report.attempts, 1);
    assert_eq!(report.failure(), Some(FailureKind::Validation));

    let report = h.signup_with_name(2, "Jo").await;
    assert_eq!(report.attempts, 1);
    assert_eq!(report.failure(), Some(FailureKind::Validation));

    assert!(h.dead_letters.is_empty());
    assert!(h.ledger.is_empty());
    assert_eq!(h.registry.len(), 1);

    h.worker.stop().await;
}

impl Harness {
    async fn signup_with_name(&mut self, rider: u32, name: &str) -> TaskReport {
        self.bus
            .publish(&fixtures::signup_message(rider, name))
            .await
            .unwrap();
        self.next_report().await
    }
}

#[tokio::test]
async fn duplicates_are_dropped_without_side_effects() {
    let mut h = Harness::new(FinalDisposition::Park).started().await;
    h.signup(1).await;

    let report = h.signup_with_name(1, "Someone Else").await;
    assert_eq!(report.failure(), Some(FailureKind::AlreadyExists));
    assert_eq!(report.attempts, 1);
    assert_eq!(h.registry.get(&fixtures::rider_id(1)).unwrap().name.as_str(), "John Doe");

    assert!(h.complete(1, 1, 20.0).await.is_completed());
    let report = h.complete(1, 1, 20.0).await;
    assert_eq!(report.failure(), Some(FailureKind::DuplicateRide));
    assert_eq!(report.attempts, 1);
    assert_eq!(h.ledger.len(), 1);
    assert!(h.dead_letters.is_empty());

    h.worker.stop().await;
}

#[tokio::test]
async fn transient_store_failure_recovers_on_redelivery() {
    let mut h = Harness::new(FinalDisposition::Park).started().await;
    h.signup(1).await;
    h.ledger.fail_next_records(1);

    let report = h.complete(1, 1, 15.0).await;
    assert!(report.is_completed());
    assert_eq!(report.attempts, 2);
    assert_eq!(h.ledger.len(), 1);

    h.worker.stop().await;
}

#[tokio::test]
async fn promotion_applies_to_later_rides_only() {
    let tiers = TierTable::new(vec![
        TierRule::new(Tier::Bronze, 0, 1),
        TierRule::new(Tier::Silver, 2, 3),
    ])
    .unwrap();
    let mut h = Harness::build(
        InMemoryRiderRegistry::new(),
        None,
        tiers,
        config(FinalDisposition::Drop),
    )
    .started()
    .await;
    h.signup(1).await;

    assert_eq!(recorded_points(&h.complete(1, 1, 10.0).await), 10);

    let report = h.complete(2, 1, 10.0).await;
    assert_eq!(recorded_points(&report), 10);
    match &report.status {
        TaskStatus::Completed(Outcome::RideRecorded(outcome)) => {
            let promotion = outcome.promotion.as_ref().unwrap();
            assert_eq!((promotion.from, promotion.to), (Tier::Bronze, Tier::Silver));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(h.registry.get(&fixtures::rider_id(1)).unwrap().status, Tier::Silver);

    assert_eq!(recorded_points(&h.complete(3, 1, 10.0).await), 30);

    let silver_rides = h
        .ledger
        .find(
            &RideFilter::for_rider(fixtures::rider_id(1)).at_tier(Tier::Silver),
            &RideProjection::id_only(),
        )
        .await
        .unwrap();
    assert_eq!(silver_rides.len(), 1);
    assert_eq!(silver_rides[0].id, fixtures::ride_id(3));

    h.worker.stop().await;
}

#[tokio::test]
async fn start_twice_is_rejected_and_stop_is_idempotent() {
    let h = Harness::new(FinalDisposition::Drop).started().await;
    assert!(h.worker.is_running().await);
    assert!(matches!(h.worker.start().await, Err(WorkerError::AlreadyRunning(_))));

    h.worker.stop().await;
    assert!(!h.worker.is_running().await);
    h.worker.stop().await;
}

#[tokio::test]
async fn start_surfaces_subscription_failure() {
    let h = Harness::new(FinalDisposition::Drop);
    h.bus.fail_next_subscribes(1);

    assert!(matches!(h.worker.start().await, Err(WorkerError::Subscribe(_))));
    assert!(!h.worker.is_running().await);

    tokio_test::assert_ok!(h.worker.start().await);
    h.worker.stop().await;
}

#[tokio::test]
async fn resubscribes_after_stream_ends() {
    let mut h = Harness::new(FinalDisposition::Drop).started().await;
    h.bus.fail_next_subscribes(1);
    h.bus.disconnect_all();

    let bus = h.bus.clone();
    wait_until(|| bus.subscriptions() == 2).await;

    assert!(h.signup(1).await.is_completed());
    h.worker.stop().await;
}

#[tokio::test]
async fn transport_errors_do_not_stop_consumption() {
    let mut h = Harness::new(FinalDisposition::Drop).started().await;
    h.bus.inject_error("broker hiccup");

    assert!(h.signup(1).await.is_completed());
    assert!(h.worker.is_running().await);
    h.worker.stop().await;
}

#[tokio::test]
async fn stop_drains_in_flight_messages() {
    let registry = InMemoryRiderRegistry::new();
    let slow = Arc::new(SlowFinds::new(registry.clone(), Duration::from_millis(200)));
    let mut h = Harness::build(
        registry,
        Some(Arc::clone(&slow) as Arc<dyn RiderRegistry>),
        TierTable::standard(),
        config(FinalDisposition::Drop),
    )
    .started()
    .await;
    h.signup(1).await;
    slow.stall_next(1);

    h.bus
        .publish(&fixtures::completion_message(1, 1, 10.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.worker.stop().await;

    assert_eq!(h.ledger.len(), 1);
    assert!(h.next_report().await.is_completed());
}

#[tokio::test]
async fn timed_out_attempt_keeps_running_in_background() {
    let registry = InMemoryRiderRegistry::new();
    let slow = Arc::new(SlowFinds::new(registry.clone(), Duration::from_millis(300)));
    let mut config = config(FinalDisposition::Drop);
    config.task_timeout = Duration::from_millis(50);
    let mut h = Harness::build(
        registry,
        Some(Arc::clone(&slow) as Arc<dyn RiderRegistry>),
        TierTable::standard(),
        config,
    )
    .started()
    .await;
    h.signup(1).await;
    slow.stall_next(1);

    let report = h.complete(1, 1, 10.0).await;
    assert_eq!(report.attempts, 2);
    assert_eq!(report.failure(), Some(FailureKind::Persistence));

    let ledger = h.ledger.clone();
    wait_until(|| ledger.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.ledger.len(), 1);

    h.worker.stop().await;
}

#[tokio::test]
async fn messages_are_acknowledged_once_handled() {
    let mut h = Harness::new(FinalDisposition::Drop).started().await;

    assert!(h.signup(1).await.is_completed());
    assert_eq!(h.complete(1, 9, 10.0).await.failure(), Some(FailureKind::UnknownRider));

    let bus = h.bus.clone();
    wait_until(|| bus.acknowledged().len() == 2).await;
    assert_eq!(
        h.bus.acknowledged(),
        vec![
            fixtures::signup_message(1, "John Doe"),
            fixtures::completion_message(1, 9, 10.0),
        ]
    );
    h.worker.stop().await;
}

#[tokio::test]
async fn in_flight_and_abandoned_messages_are_not_acknowledged() {
    let registry = InMemoryRiderRegistry::new();
    let slow = Arc::new(SlowFinds::new(registry.clone(), Duration::from_secs(2)));
    let mut config = config(FinalDisposition::Drop);
    config.task_timeout = Duration::from_secs(5);
    config.exit_timeout = Duration::from_millis(100);
    let mut h = Harness::build(
        registry,
        Some(Arc::clone(&slow) as Arc<dyn RiderRegistry>),
        TierTable::standard(),
        config,
    )
    .started()
    .await;
    h.signup(1).await;
    let bus = h.bus.clone();
    wait_until(|| bus.acknowledged().len() == 1).await;
    slow.stall_next(1);

    h.bus
        .publish(&fixtures::completion_message(1, 1, 10.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.bus.acknowledged().len(), 1);

    h.worker.stop().await;
    assert_eq!(h.bus.acknowledged(), vec![fixtures::signup_message(1, "John Doe")]);
}

/// Registry whose lookups can be made to stall.
struct SlowFinds {
    inner: InMemoryRiderRegistry,
    remaining: AtomicU32,
    delay: Duration,
}

impl SlowFinds {
    fn new(inner: InMemoryRiderRegistry, delay: Duration) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(0),
            delay,
        }
    }

    fn stall_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }
}

impl RiderRegistry for SlowFinds {
    fn register(&self, id: &RiderId, name: &RiderName, status: Tier) -> StoreFuture<'_, Rider> {
        self.inner.register(id, name, status)
    }

    fn find(&self, id: &RiderId) -> StoreFuture<'_, Option<Rider>> {
        let id = id.clone();
        Box::pin(async move {
            let stall = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stall {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.find(&id).await
        })
    }

    fn set_status(&self, id: &RiderId, status: Tier) -> StoreFuture<'_, ()> {
        self.inner.set_status(id, status)
    }

    fn compare_and_set_status(
        &self,
        id: &RiderId,
        expected: Tier,
        new: Tier,
    ) -> StoreFuture<'_, bool> {
        self.inner.compare_and_set_status(id, expected, new)
    }
}
