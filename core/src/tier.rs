//! Loyalty tiers and the rule table that drives tier resolution.
//!
//! A [`TierTable`] is an ordered list of [`TierRule`]s. Each rule names a tier,
//! the inclusive completed-ride threshold at which it is reached, and the
//! multiplier applied to a ride's floored amount while the rider holds it.
//!
//! The default table:
//!
//! | tier     | min rides | multiplier |
//! |----------|-----------|------------|
//! | bronze   | 0         | 1          |
//! | silver   | 20        | 3          |
//! | gold     | 50        | 5          |
//! | platinum | 100       | 10         |
//!
//! Resolution ([`resolve_tier`]) is pure and total, and monotonic in the ride
//! count because thresholds and tiers both strictly increase along the table.

use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Named loyalty level, ordered `Bronze < Silver < Gold < Platinum`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Entry tier.
    Bronze,
    /// Second tier.
    Silver,
    /// Third tier.
    Gold,
    /// Highest tier.
    Platinum,
}

impl Tier {
    /// All tiers in ascending order.
    pub const ALL: [Self; 4] = [Self::Bronze, Self::Silver, Self::Gold, Self::Platinum];

    /// Convert tier to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = TierTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            "platinum" => Ok(Self::Platinum),
            other => Err(TierTableError::UnknownTier(other.to_string())),
        }
    }
}

/// Errors from building or parsing a [`TierTable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierTableError {
    /// The table has no rules.
    #[error("tier table must contain at least one rule")]
    Empty,

    /// The first rule does not start at zero rides.
    #[error("first tier rule must have threshold 0, got {0}")]
    FirstThresholdNotZero(u64),

    /// Thresholds or tiers are not strictly increasing.
    #[error("tier rule '{tier}' at {threshold} rides is not above the previous rule")]
    NotAscending {
        /// Offending tier.
        tier: Tier,
        /// Offending threshold.
        threshold: u64,
    },

    /// Tier name not recognized.
    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// A rule in the textual form could not be parsed.
    #[error("malformed tier rule '{0}', expected <tier>:<min rides>:<multiplier>")]
    MalformedRule(String),
}

/// One row of the tier table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    /// Tier reached by this rule.
    pub tier: Tier,
    /// Inclusive completed-ride threshold.
    pub min_completed_rides: u64,
    /// Points per whole unit of ride amount while holding this tier.
    pub points_multiplier: u64,
}

impl TierRule {
    /// Creates a rule.
    #[must_use]
    pub const fn new(tier: Tier, min_completed_rides: u64, points_multiplier: u64) -> Self {
        Self {
            tier,
            min_completed_rides,
            points_multiplier,
        }
    }
}

/// Validated, totally ordered set of tier rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierTable {
    rules: Vec<TierRule>,
}

impl TierTable {
    /// Builds a table, checking the ordering invariants.
    ///
    /// # Errors
    ///
    /// - [`TierTableError::Empty`] for an empty rule list
    /// - [`TierTableError::FirstThresholdNotZero`] if the first rule is not at 0
    /// - [`TierTableError::NotAscending`] if tiers or thresholds do not strictly increase
    pub fn new(rules: Vec<TierRule>) -> Result<Self, TierTableError> {
        let first = rules.first().ok_or(TierTableError::Empty)?;
        if first.min_completed_rides != 0 {
            return Err(TierTableError::FirstThresholdNotZero(first.min_completed_rides));
        }

        for pair in rules.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            if current.tier <= previous.tier
                || current.min_completed_rides <= previous.min_completed_rides
            {
                return Err(TierTableError::NotAscending {
                    tier: current.tier,
                    threshold: current.min_completed_rides,
                });
            }
        }

        Ok(Self { rules })
    }

    /// The standard bronze/silver/gold/platinum table.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            rules: vec![
                TierRule::new(Tier::Bronze, 0, 1),
                TierRule::new(Tier::Silver, 20, 3),
                TierRule::new(Tier::Gold, 50, 5),
                TierRule::new(Tier::Platinum, 100, 10),
            ],
        }
    }

    /// Rules in ascending order.
    #[must_use]
    pub fn rules(&self) -> &[TierRule] {
        &self.rules
    }

    /// Default tier for a rider with zero completed rides.
    #[must_use]
    pub fn lowest(&self) -> Tier {
        self.rules[0].tier
    }

    /// See [`resolve_tier`].
    #[must_use]
    pub fn resolve_tier(&self, completed_rides: u64) -> Tier {
        resolve_tier(self, completed_rides)
    }

    /// Multiplier applied while holding `tier`.
    ///
    /// A tier missing from the table earns the multiplier of the highest rule
    /// below it.
    #[must_use]
    pub fn multiplier(&self, tier: Tier) -> u64 {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.tier <= tier)
            .unwrap_or(&self.rules[0])
            .points_multiplier
    }

    /// Loyalty points for a ride: `floor(amount) * multiplier(tier)`.
    #[must_use]
    pub fn points_for(&self, amount: Amount, tier: Tier) -> u64 {
        amount.whole_units().saturating_mul(self.multiplier(tier))
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl FromStr for TierTable {
    type Err = TierTableError;

    /// Parses `bronze:0:1,silver:20:3,...`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rules = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut fields = part.split(':');
                match (fields.next(), fields.next(), fields.next(), fields.next()) {
                    (Some(tier), Some(min), Some(multiplier), None) => Ok(TierRule::new(
                        tier.trim().parse()?,
                        min.trim()
                            .parse()
                            .map_err(|_| TierTableError::MalformedRule(part.to_string()))?,
                        multiplier
                            .trim()
                            .parse()
                            .map_err(|_| TierTableError::MalformedRule(part.to_string()))?,
                    )),
                    _ => Err(TierTableError::MalformedRule(part.to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(rules)
    }
}

/// Resolves the tier for a completed-ride count.
///
/// Returns the tier of the last rule whose threshold is `<= completed_rides`,
/// i.e. the highest satisfied threshold.
#[must_use]
pub fn resolve_tier(table: &TierTable, completed_rides: u64) -> Tier {
    table
        .rules
        .iter()
        .take_while(|rule| rule.min_completed_rides <= completed_rides)
        .last()
        .map_or_else(|| table.lowest(), |rule| rule.tier)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_rides_is_the_lowest_tier() {
        assert_eq!(TierTable::standard().resolve_tier(0), Tier::Bronze);
    }

    #[test]
    fn tier_boundaries() {
        let tiers = TierTable::standard();
        assert_eq!(tiers.resolve_tier(19), Tier::Bronze);
        assert_eq!(tiers.resolve_tier(20), Tier::Silver);
        assert_eq!(tiers.resolve_tier(49), Tier::Silver);
        assert_eq!(tiers.resolve_tier(50), Tier::Gold);
        assert_eq!(tiers.resolve_tier(99), Tier::Gold);
        assert_eq!(tiers.resolve_tier(100), Tier::Platinum);
        assert_eq!(tiers.resolve_tier(10_000), Tier::Platinum);
    }

    #[test]
    fn multipliers_follow_the_table() {
        let tiers = TierTable::standard();
        assert_eq!(tiers.multiplier(Tier::Bronze), 1);
        assert_eq!(tiers.multiplier(Tier::Silver), 3);
        assert_eq!(tiers.multiplier(Tier::Gold), 5);
        assert_eq!(tiers.multiplier(Tier::Platinum), 10);
    }

    #[test]
    fn points_floor_the_amount() {
        let tiers = TierTable::standard();
        assert_eq!(tiers.points_for(Amount::from_cents(2000), Tier::Bronze), 20);
        assert_eq!(tiers.points_for(Amount::from_cents(2000), Tier::Silver), 60);
        assert_eq!(tiers.points_for(Amount::from_cents(2099), Tier::Gold), 100);
        assert_eq!(tiers.points_for(Amount::from_cents(99), Tier::Platinum), 0);
    }

    #[test]
    fn missing_tier_uses_the_rule_below() {
        let tiers = TierTable::new(vec![
            TierRule::new(Tier::Bronze, 0, 1),
            TierRule::new(Tier::Gold, 10, 4),
        ])
        .unwrap();
        assert_eq!(tiers.multiplier(Tier::Silver), 1);
        assert_eq!(tiers.multiplier(Tier::Platinum), 4);
    }

    #[test]
    fn rejects_invalid_tables() {
        assert_eq!(TierTable::new(vec![]), Err(TierTableError::Empty));
        assert_eq!(
            TierTable::new(vec![TierRule::new(Tier::Bronze, 5, 1)]),
            Err(TierTableError::FirstThresholdNotZero(5))
        );
        assert!(matches!(
            TierTable::new(vec![
                TierRule::new(Tier::Bronze, 0, 1),
                TierRule::new(Tier::Silver, 0, 3),
            ]),
            Err(TierTableError::NotAscending { .. })
        ));
        assert!(matches!(
            TierTable::new(vec![
                TierRule::new(Tier::Silver, 0, 1),
                TierRule::new(Tier::Bronze, 10, 3),
            ]),
            Err(TierTableError::NotAscending { .. })
        ));
    }

    #[test]
    fn parses_textual_table() {
        let parsed: TierTable = "bronze:0:1, silver:20:3,gold:50:5,platinum:100:10"
            .parse()
            .unwrap();
        assert_eq!(parsed, TierTable::standard());
    }

    #[test]
    fn rejects_malformed_textual_rules() {
        assert!(matches!(
            "bronze:0".parse::<TierTable>(),
            Err(TierTableError::MalformedRule(_))
        ));
        assert!(matches!(
            "bronze:zero:1".parse::<TierTable>(),
            Err(TierTableError::MalformedRule(_))
        ));
        assert_eq!(
            "diamond:0:1".parse::<TierTable>(),
            Err(TierTableError::UnknownTier("diamond".to_string()))
        );
    }

    #[test]
    fn tier_names_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
    }

    proptest! {
        #[test]
        fn resolution_is_monotonic(count in 0u64..100_000) {
            let tiers = TierTable::standard();
            prop_assert!(tiers.resolve_tier(count) <= tiers.resolve_tier(count + 1));
        }

        #[test]
        fn resolved_tier_threshold_is_satisfied(count in 0u64..100_000) {
            let tiers = TierTable::standard();
            let tier = tiers.resolve_tier(count);
            let rule = tiers.rules().iter().find(|r| r.tier == tier).unwrap();
            prop_assert!(rule.min_completed_rides <= count);
        }
    }
}
