//! Read projection over the registry and ledger.

use loyalty_core::store::{RideLedger, RiderRegistry};
use loyalty_core::{LoyaltyError, RiderId, RiderSummary};
use std::sync::Arc;

/// Builds [`RiderSummary`] views.
#[derive(Clone)]
pub struct LoyaltyQuery {
    registry: Arc<dyn RiderRegistry>,
    ledger: Arc<dyn RideLedger>,
}

impl LoyaltyQuery {
    /// Reads from `registry` and `ledger`.
    #[must_use]
    pub fn new(registry: Arc<dyn RiderRegistry>, ledger: Arc<dyn RideLedger>) -> Self {
        Self { registry, ledger }
    }

    /// Rider fields plus ride count and point total. `None` for an unknown
    /// rider; a rider without rides has zero points.
    ///
    /// # Errors
    ///
    /// [`LoyaltyError::Persistence`] on storage failure.
    pub async fn rider_summary(&self, id: &RiderId) -> Result<Option<RiderSummary>, LoyaltyError> {
        let Some(rider) = self.registry.find(id).await? else {
            return Ok(None);
        };
        let rides = self.ledger.count_for_rider(id).await?;
        let loyalty_points = self.ledger.points_for_rider(id).await?;

        Ok(Some(RiderSummary {
            id: rider.id,
            name: rider.name,
            status: rider.status,
            rides,
            loyalty_points,
        }))
    }
}
