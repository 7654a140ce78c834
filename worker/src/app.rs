//! Service wiring.

use crate::Config;
use loyalty_core::TierTable;
use loyalty_core::dead_letter::DeadLetterSink;
use loyalty_core::event::EventKind;
use loyalty_core::event_bus::EventBus;
use loyalty_core::store::{RideLedger, RiderRegistry};
use loyalty_postgres::{PostgresDeadLetterQueue, PostgresRideLedger, PostgresRiderRegistry};
use loyalty_redpanda::RedpandaEventBus;
use loyalty_runtime::metrics::MetricsServer;
use loyalty_runtime::{EventIngress, LoyaltyWorker};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The running loyalty service.
pub struct LoyaltyApp {
    worker: LoyaltyWorker,
    // Held to keep the exporter handle alive.
    _metrics: MetricsServer,
}

impl LoyaltyApp {
    /// Connects to every backing service and builds a stopped worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics exporter, database, migrations or
    /// event bus cannot be initialized.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let mut metrics = MetricsServer::new(config.metrics_addr);
        metrics.start()?;
        info!(addr = %config.metrics_addr, "Metrics exporter listening");

        let pool = loyalty_postgres::connect_with(
            &config.database.url,
            config.database.max_connections,
            Duration::from_secs(config.database.connect_timeout),
        )
        .await?;
        loyalty_postgres::migrate(&pool).await?;
        info!("Database connected and migrated");

        let registry: Arc<dyn RiderRegistry> = Arc::new(PostgresRiderRegistry::new(pool.clone()));
        let ledger: Arc<dyn RideLedger> = Arc::new(PostgresRideLedger::new(pool.clone()));
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(PostgresDeadLetterQueue::new(pool));

        let redpanda = &config.redpanda;
        let mut bus = RedpandaEventBus::builder()
            .brokers(&redpanda.brokers)
            .auto_offset_reset(&redpanda.auto_offset_reset);
        if let Some(group) = &redpanda.consumer_group {
            bus = bus.consumer_group(group);
        }
        let bus: Arc<dyn EventBus> = Arc::new(bus.build()?);
        info!(brokers = %redpanda.brokers, "Event bus configured");

        let tiers: Arc<TierTable> = Arc::new(config.tiers.clone());
        let ingress = EventIngress::new(registry, ledger, tiers)
            .with_topic(EventKind::Signup, &redpanda.signup_topic)
            .with_topic(EventKind::Completion, &redpanda.completion_topic);

        let worker = LoyaltyWorker::new(ingress, bus, dead_letters, config.worker_config());
        Ok(Self {
            worker,
            _metrics: metrics,
        })
    }

    /// Starts consuming.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot subscribe.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.worker.start().await?;
        Ok(())
    }

    /// Stops consuming and drains in-flight messages.
    pub async fn shutdown(&self) {
        self.worker.stop().await;
    }
}
