//! In-memory dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use loyalty_core::LoyaltyError;
use loyalty_core::dead_letter::{DeadLetterSink, ParkedEvent};
use loyalty_core::store::StoreFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Collects parked events in memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    parked: Arc<RwLock<Vec<ParkedEvent>>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked events, oldest first.
    #[must_use]
    pub fn parked(&self) -> Vec<ParkedEvent> {
        self.parked.read().unwrap().clone()
    }

    /// Number of parked events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.read().unwrap().len()
    }

    /// Whether nothing was parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.read().unwrap().is_empty()
    }

    /// Make the next `n` calls to `park` fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn park(&self, event: ParkedEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(LoyaltyError::Persistence("injected park failure".to_string()));
            }
            self.parked.write().unwrap().push(event);
            Ok(())
        })
    }
}
