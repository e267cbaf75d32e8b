//! Fixed-point money codec.
//!
//! Balances and accruals are stored as integer hundredths so that arithmetic
//! on them never drifts. Decimals only appear at the boundaries: values coming
//! from the accrual oracle and amounts supplied by callers.

use crate::error::{LedgerError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places kept by the fixed-point representation.
pub const SCALE: u32 = 2;

const FACTOR: i64 = 100;

/// Converts a decimal amount to integer hundredths.
///
/// The integer and fractional parts are scaled separately and anything beyond
/// the second decimal place is truncated, so `5.0` becomes exactly `500`.
/// Negative values are rejected.
pub fn to_fixed_point(value: Decimal) -> Result<i64> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "{} must not be negative",
            value
        )));
    }

    let integer = value
        .trunc()
        .to_i64()
        .and_then(|i| i.checked_mul(FACTOR))
        .ok_or_else(|| LedgerError::InvalidAmount(format!("{} is out of range", value)))?;
    let fraction = (value.fract() * Decimal::from(FACTOR))
        .trunc()
        .to_i64()
        .unwrap_or(0);

    integer
        .checked_add(fraction)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("{} is out of range", value)))
}

/// Converts integer hundredths back to a decimal with two decimal places.
pub fn to_decimal(fixed: i64) -> Decimal {
    Decimal::new(fixed, SCALE)
}

/// An amount of loyalty points held as integer hundredths.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use accrual_ledger::Points;
///
/// let amount = Points::from_str("5.5").unwrap();
/// assert_eq!(amount.cents(), 550);
/// assert_eq!(amount.to_string(), "5.50");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Points(i64);

impl Points {
    /// Zero value.
    pub const ZERO: Self = Points(0);

    /// Wraps an already fixed-point value.
    pub const fn from_cents(cents: i64) -> Self {
        Points(cents)
    }

    /// Converts a decimal amount, truncating past the second decimal place.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        to_fixed_point(value).map(Points)
    }

    /// The raw fixed-point value.
    pub fn cents(&self) -> i64 {
        self.0
    }

    pub fn to_decimal(&self) -> Decimal {
        to_decimal(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Points)
    }

    /// Addition for totals that are only reported, never stored.
    pub fn saturating_add(self, rhs: Self) -> Self {
        Points(self.0.saturating_add(rhs.0))
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Points)
    }
}

impl FromStr for Points {
    type Err = LedgerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)
            .map_err(|e| LedgerError::InvalidAmount(format!("{:?}: {}", trimmed, e)))?;
        Points::from_decimal(decimal)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.to_decimal())
    }
}

impl Serialize for Points {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Points::from_str(&s).map_err(serde::de::Error::custom)
    }
}
