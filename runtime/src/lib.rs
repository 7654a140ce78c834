//! # Loyalty Runtime
//!
//! Event handling for the rider loyalty ledger.
//!
//! This crate turns raw bus messages into ledger writes: ingress validates and
//! routes, coordinators apply the signup and completion flows under per-rider
//! locks, and the worker drives everything from an event bus with bounded
//! concurrency, timeouts and redelivery.
//!
//! ## Core Components
//!
//! - **[`EventIngress`]**: shape validation and dispatch by routing key
//! - **[`SignupCoordinator`] / [`CompletionCoordinator`]**: the two event flows
//! - **[`RiderLocks`]**: per-rider serialization
//! - **[`LoyaltyWorker`]**: the long-running bus consumer
//! - **[`LoyaltyQuery`]**: the read projection
//!
//! ## Example
//!
//! ```ignore
//! use loyalty_runtime::{EventIngress, LoyaltyWorker, WorkerConfig};
//!
//! let ingress = EventIngress::new(registry, ledger, Arc::new(TierTable::standard()));
//! let worker = LoyaltyWorker::new(ingress, event_bus, dead_letters, WorkerConfig::default());
//!
//! worker.start().await?;
//! // ...
//! worker.stop().await;
//! ```

/// Signup and completion flows
pub mod coordinator;

/// Message validation and routing
pub mod ingress;

/// Per-rider mutual exclusion
pub mod locks;

/// Prometheus metrics for observability
pub mod metrics;

/// Read projection
pub mod query;

/// Bounded redelivery with exponential backoff
pub mod redelivery;

/// Bus consumer service
pub mod worker;

pub use coordinator::{CompletionCoordinator, CompletionOutcome, Promotion, SignupCoordinator, StageError};
pub use ingress::{EventIngress, Outcome};
pub use locks::RiderLocks;
pub use query::LoyaltyQuery;
pub use redelivery::{FinalDisposition, RedeliveryPolicy};
pub use worker::{LoyaltyWorker, TaskReport, TaskStatus, WorkerConfig, WorkerError};
