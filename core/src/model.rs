//! Rider and ride records, ride filters and field projections.

use crate::tier::{Tier, TierTable};
use crate::types::{Amount, RideId, RiderId, RiderName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered rider.
///
/// Created exactly once by the signup flow; `status` is the only field that
/// changes afterwards and it never moves down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rider {
    /// Upstream-assigned identifier.
    pub id: RiderId,
    /// Display name.
    pub name: RiderName,
    /// Current tier.
    pub status: Tier,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// An immutable completed-ride record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ride {
    /// Upstream-assigned identifier (idempotency key).
    pub id: RideId,
    /// Owning rider.
    pub rider_id: RiderId,
    /// Fare amount.
    pub amount: Amount,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
    /// Rider tier immediately before this ride.
    pub status_at_completion: Tier,
    /// `floor(amount) * multiplier(status_at_completion)`.
    pub loyalty_points: u64,
}

/// Ride about to be recorded.
///
/// `finished_at` is optional; the ledger fills it from its clock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRide {
    /// Ride identifier.
    pub id: RideId,
    /// Owning rider.
    pub rider_id: RiderId,
    /// Fare amount.
    pub amount: Amount,
    /// Completion time, if known.
    pub finished_at: Option<DateTime<Utc>>,
    /// Tier snapshot.
    pub status_at_completion: Tier,
    /// Computed points.
    pub loyalty_points: u64,
}

impl NewRide {
    /// Builds a ride snapshot for a rider currently holding `status`,
    /// computing its points from `tiers`.
    #[must_use]
    pub fn complete(
        id: RideId,
        rider_id: RiderId,
        amount: Amount,
        status: Tier,
        tiers: &TierTable,
    ) -> Self {
        Self {
            id,
            rider_id,
            amount,
            finished_at: None,
            status_at_completion: status,
            loyalty_points: tiers.points_for(amount, status),
        }
    }

    /// Sets an explicit completion time.
    #[must_use]
    pub const fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Converts into the stored record, defaulting the completion time.
    #[must_use]
    pub fn into_ride(self, default_finished_at: DateTime<Utc>) -> Ride {
        Ride {
            id: self.id,
            rider_id: self.rider_id,
            amount: self.amount,
            finished_at: self.finished_at.unwrap_or(default_finished_at),
            status_at_completion: self.status_at_completion,
            loyalty_points: self.loyalty_points,
        }
    }
}

/// Equality filter over rides. Empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RideFilter {
    /// Match rides of this rider.
    pub rider_id: Option<RiderId>,
    /// Match rides completed at this tier.
    pub status_at_completion: Option<Tier>,
}

impl RideFilter {
    /// Filter on the owning rider.
    #[must_use]
    pub const fn for_rider(rider_id: RiderId) -> Self {
        Self {
            rider_id: Some(rider_id),
            status_at_completion: None,
        }
    }

    /// Adds a tier condition.
    #[must_use]
    pub const fn at_tier(mut self, tier: Tier) -> Self {
        self.status_at_completion = Some(tier);
        self
    }

    /// Returns true if `ride` satisfies every set condition.
    #[must_use]
    pub fn matches(&self, ride: &Ride) -> bool {
        self.rider_id.as_ref().is_none_or(|id| *id == ride.rider_id)
            && self
                .status_at_completion
                .is_none_or(|tier| tier == ride.status_at_completion)
    }
}

/// Selectable ride field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RideField {
    /// `rider_id`
    RiderId,
    /// `amount`
    Amount,
    /// `finished_at`
    FinishedAt,
    /// `status_at_completion`
    StatusAtCompletion,
    /// `loyalty_points`
    LoyaltyPoints,
}

impl RideField {
    /// Every selectable field.
    pub const ALL: [Self; 5] = [
        Self::RiderId,
        Self::Amount,
        Self::FinishedAt,
        Self::StatusAtCompletion,
        Self::LoyaltyPoints,
    ];

    /// Column name of the field.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RiderId => "rider_id",
            Self::Amount => "amount",
            Self::FinishedAt => "finished_at",
            Self::StatusAtCompletion => "status_at_completion",
            Self::LoyaltyPoints => "loyalty_points",
        }
    }
}

/// Which ride fields a read returns. The id is always returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RideProjection {
    fields: Vec<RideField>,
}

impl RideProjection {
    /// All fields.
    #[must_use]
    pub fn all() -> Self {
        Self {
            fields: RideField::ALL.to_vec(),
        }
    }

    /// Only the given fields (plus the id).
    #[must_use]
    pub fn only(fields: impl IntoIterator<Item = RideField>) -> Self {
        let mut selected: Vec<RideField> = Vec::new();
        for field in fields {
            if !selected.contains(&field) {
                selected.push(field);
            }
        }
        Self { fields: selected }
    }

    /// Just the id.
    #[must_use]
    pub const fn id_only() -> Self {
        Self { fields: Vec::new() }
    }

    /// Whether `field` is selected.
    #[must_use]
    pub fn includes(&self, field: RideField) -> bool {
        self.fields.contains(&field)
    }

    /// Selected fields.
    #[must_use]
    pub fn fields(&self) -> &[RideField] {
        &self.fields
    }

    /// Projects a stored ride.
    #[must_use]
    pub fn apply(&self, ride: &Ride) -> ProjectedRide {
        ProjectedRide {
            id: ride.id.clone(),
            rider_id: self
                .includes(RideField::RiderId)
                .then(|| ride.rider_id.clone()),
            amount: self.includes(RideField::Amount).then_some(ride.amount),
            finished_at: self
                .includes(RideField::FinishedAt)
                .then_some(ride.finished_at),
            status_at_completion: self
                .includes(RideField::StatusAtCompletion)
                .then_some(ride.status_at_completion),
            loyalty_points: self
                .includes(RideField::LoyaltyPoints)
                .then_some(ride.loyalty_points),
        }
    }
}

impl Default for RideProjection {
    fn default() -> Self {
        Self::all()
    }
}

/// A ride with only the projected fields populated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedRide {
    /// Ride identifier.
    pub id: RideId,
    /// Owning rider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rider_id: Option<RiderId>,
    /// Fare amount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    /// Completion time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Tier snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_at_completion: Option<Tier>,
    /// Points awarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loyalty_points: Option<u64>,
}

/// Read-side view of a rider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiderSummary {
    /// Rider identifier.
    pub id: RiderId,
    /// Display name.
    pub name: RiderName,
    /// Current tier.
    pub status: Tier,
    /// Completed rides.
    pub rides: u64,
    /// Sum of points over all rides.
    pub loyalty_points: u64,
}
