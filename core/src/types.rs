//! Identifier and value types shared by riders and rides.
//!
//! Identifiers are assigned upstream (by the signup and completion events),
//! never generated locally. They are 24-character hexadecimal tokens and are
//! normalized to lowercase so that `"ABC..."` and `"abc..."` name the same
//! entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of an identifier token.
pub const IDENTIFIER_LEN: usize = 24;

/// Minimum display-name length (in characters) accepted at ingress.
pub const MIN_NAME_LEN: usize = 6;

/// Errors raised when building a value type from untrusted input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// Identifier is not a 24-character hexadecimal token.
    #[error("invalid identifier '{value}': expected {IDENTIFIER_LEN} hexadecimal characters")]
    InvalidIdentifier {
        /// The rejected input.
        value: String,
    },

    /// Display name is shorter than [`MIN_NAME_LEN`].
    #[error("name must contain at least {MIN_NAME_LEN} characters, got {length}")]
    NameTooShort {
        /// Character count of the rejected name.
        length: usize,
    },

    /// Amount is negative, not finite, or out of range.
    #[error("amount must be a finite number >= 0, got {0}")]
    InvalidAmount(f64),

    /// Amount has more than two fractional digits.
    #[error("amount must have at most 2 decimal places, got {0}")]
    AmountPrecision(f64),
}

fn parse_identifier(value: &str) -> Result<String, ValueError> {
    if value.len() == IDENTIFIER_LEN && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(value.to_ascii_lowercase())
    } else {
        Err(ValueError::InvalidIdentifier {
            value: value.to_string(),
        })
    }
}

macro_rules! hex_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses and normalizes a hexadecimal identifier.
            ///
            /// # Errors
            ///
            /// Returns [`ValueError::InvalidIdentifier`] unless the input is exactly
            /// 24 hexadecimal characters.
            pub fn parse(value: &str) -> Result<Self, ValueError> {
                parse_identifier(value).map(Self)
            }

            /// Returns the normalized (lowercase) token.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValueError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_identifier! {
    /// Unique identifier of a rider, assigned by the signup event.
    RiderId
}

hex_identifier! {
    /// Unique identifier of a ride, assigned by the completion event.
    ///
    /// This is the idempotency key of the ledger.
    RideId
}

/// Rider display name (at least [`MIN_NAME_LEN`] characters).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RiderName(String);

impl RiderName {
    /// Validates a display name.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::NameTooShort`] when the name has fewer than
    /// [`MIN_NAME_LEN`] characters.
    pub fn parse(value: impl Into<String>) -> Result<Self, ValueError> {
        let value = value.into();
        let length = value.chars().count();
        if length < MIN_NAME_LEN {
            return Err(ValueError::NameTooShort { length });
        }
        Ok(Self(value))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RiderName {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RiderName> for String {
    fn from(name: RiderName) -> Self {
        name.0
    }
}

impl fmt::Display for RiderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ride amount in cents (avoids floating point issues)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Largest amount accepted from a decimal, in cents (f64 stays exact below 2^53).
    const MAX_CENTS: f64 = 9_007_199_254_740_991.0;

    /// Creates an amount from cents.
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents.
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Returns `floor(amount)`, the whole units that earn points.
    #[must_use]
    pub const fn whole_units(&self) -> u64 {
        self.0 / 100
    }

    /// Converts a decimal amount with at most two fractional digits.
    ///
    /// # Errors
    ///
    /// - [`ValueError::InvalidAmount`] for negative, non-finite or oversized values
    /// - [`ValueError::AmountPrecision`] for more than two decimal places
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // range checked above the cast
    pub fn from_decimal(value: f64) -> Result<Self, ValueError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ValueError::InvalidAmount(value));
        }

        let scaled = value * 100.0;
        let rounded = scaled.round();
        // Scaling error grows with magnitude.
        let tolerance = (scaled * f64::EPSILON * 4.0).max(1e-6);
        if (scaled - rounded).abs() > tolerance {
            return Err(ValueError::AmountPrecision(value));
        }
        if rounded > Self::MAX_CENTS {
            return Err(ValueError::InvalidAmount(value));
        }

        Ok(Self(rounded as u64))
    }

    /// Returns the amount as a decimal number.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // amounts stay far below 2^53 cents
    pub fn as_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_accept_24_hex_characters() {
        let id = RiderId::parse("000000000000000000000001").unwrap();
        assert_eq!(id.as_str(), "000000000000000000000001");
    }

    #[test]
    fn identifiers_are_normalized_to_lowercase() {
        let upper = RideId::parse("ABCDEF0123456789ABCDEF01").unwrap();
        let lower = RideId::parse("abcdef0123456789abcdef01").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn identifiers_reject_malformed_tokens() {
        assert!(RiderId::parse("not valid").is_err());
        assert!(RiderId::parse("00000000000000000000001").is_err()); // 23 chars
        assert!(RiderId::parse("0000000000000000000000001").is_err()); // 25 chars
        assert!(RiderId::parse("00000000000000000000000g").is_err());
    }

    #[test]
    fn identifiers_deserialize_through_validation() {
        let ok: Result<RiderId, _> = serde_json::from_str("\"000000000000000000000002\"");
        assert!(ok.is_ok());
        let bad: Result<RiderId, _> = serde_json::from_str("\"xyz\"");
        assert!(bad.is_err());
    }

    #[test]
    fn names_need_six_characters() {
        assert!(RiderName::parse("John Doe").is_ok());
        assert!(RiderName::parse("Sixsix").is_ok());
        assert_eq!(
            RiderName::parse("Jane"),
            Err(ValueError::NameTooShort { length: 4 })
        );
    }

    #[test]
    fn names_count_characters_not_bytes() {
        assert!(RiderName::parse("Zoë").is_err());
        assert!(RiderName::parse("Chloé B").is_ok());
    }

    #[test]
    fn amounts_from_decimal() {
        assert_eq!(Amount::from_decimal(20.0).unwrap().cents(), 2000);
        assert_eq!(Amount::from_decimal(12.34).unwrap().cents(), 1234);
        assert_eq!(Amount::from_decimal(0.0).unwrap().cents(), 0);
        assert_eq!(Amount::from_decimal(0.1).unwrap().cents(), 10);
    }

    #[test]
    fn large_two_decimal_amounts_are_exact() {
        assert_eq!(
            Amount::from_decimal(1_234_567_890.12).unwrap().cents(),
            123_456_789_012
        );
        assert_eq!(
            Amount::from_decimal(99_999_999.99).unwrap().cents(),
            9_999_999_999
        );
        assert_eq!(
            Amount::from_decimal(1_234_567_890.123),
            Err(ValueError::AmountPrecision(1_234_567_890.123))
        );
    }

    #[test]
    fn amounts_reject_negative_and_imprecise_values() {
        assert_eq!(Amount::from_decimal(-2.0), Err(ValueError::InvalidAmount(-2.0)));
        assert_eq!(
            Amount::from_decimal(1.234),
            Err(ValueError::AmountPrecision(1.234))
        );
        assert!(Amount::from_decimal(f64::NAN).is_err());
        assert!(Amount::from_decimal(f64::INFINITY).is_err());
    }

    #[test]
    fn whole_units_floor_the_amount() {
        assert_eq!(Amount::from_cents(2099).whole_units(), 20);
        assert_eq!(Amount::from_cents(99).whole_units(), 0);
    }

    #[test]
    fn amount_display() {
        assert_eq!(Amount::from_cents(1205).to_string(), "12.05");
    }
}
