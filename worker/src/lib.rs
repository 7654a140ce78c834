//! # Loyalty Worker
//!
//! Configuration and wiring for the rider loyalty worker binary.
//!
//! The binary reads [`Config`] from the environment, connects to `PostgreSQL`
//! and `RedPanda`, and runs a [`loyalty_runtime::LoyaltyWorker`] until it
//! receives a shutdown signal.

pub mod app;
pub mod config;

pub use app::LoyaltyApp;
pub use config::{Config, ConfigError, LogFormat};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the built-in filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,loyalty_runtime=debug,sqlx=warn,rdkafka=warn".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
