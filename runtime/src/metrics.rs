//! Prometheus metrics for the loyalty worker.
//!
//! Metrics cover event intake, outcomes per failure kind, ledger writes, tier
//! promotions and the redelivery machinery.
//!
//! # Example
//!
//! ```rust,no_run
//! use loyalty_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use loyalty_core::{FailureKind, Tier};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// logs a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(%addr, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "loyalty_events_received_total",
        "Total number of bus messages received by the worker"
    );
    describe_counter!(
        "loyalty_events_failed_total",
        "Total number of messages whose final attempt failed, by failure kind"
    );
    describe_counter!(
        "loyalty_rides_recorded_total",
        "Total number of rides appended to the ledger"
    );
    describe_counter!(
        "loyalty_points_awarded_total",
        "Total loyalty points awarded"
    );
    describe_counter!(
        "loyalty_tier_promotions_total",
        "Total number of tier promotions, by new tier"
    );
    describe_counter!(
        "loyalty_redeliveries_total",
        "Total number of redelivery attempts"
    );
    describe_counter!(
        "loyalty_events_parked_total",
        "Total number of events stored in the dead-letter sink"
    );
    describe_histogram!(
        "loyalty_event_duration_seconds",
        "Time taken to process a message, across all attempts"
    );
}

/// Loyalty metrics recorder.
pub struct LoyaltyMetrics;

impl LoyaltyMetrics {
    /// Record a received message.
    pub fn record_received(routing_key: &str) {
        counter!("loyalty_events_received_total", "routing_key" => routing_key.to_string())
            .increment(1);
    }

    /// Record a message that finished with an error.
    pub fn record_failure(kind: FailureKind) {
        counter!("loyalty_events_failed_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a ride insert and its points.
    pub fn record_ride(points: u64) {
        counter!("loyalty_rides_recorded_total").increment(1);
        counter!("loyalty_points_awarded_total").increment(points);
    }

    /// Record a tier promotion.
    pub fn record_promotion(tier: Tier) {
        counter!("loyalty_tier_promotions_total", "tier" => tier.as_str()).increment(1);
    }

    /// Record a redelivery attempt.
    pub fn record_redelivery() {
        counter!("loyalty_redeliveries_total").increment(1);
    }

    /// Record a parked event.
    pub fn record_parked() {
        counter!("loyalty_events_parked_total").increment(1);
    }

    /// Record total processing time of one message.
    pub fn record_duration(duration: Duration) {
        histogram!("loyalty_event_duration_seconds").record(duration.as_secs_f64());
    }
}
