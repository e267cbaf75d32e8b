//! Order models: numbers, statuses and resolutions.

use crate::error::{LedgerError, Result};
use crate::money::Points;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A purchase order number.
///
/// Only Luhn-valid numbers that fit the signed 64-bit storage column can be
/// constructed through [`OrderNumber::new`] or parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct OrderNumber(u64);

impl OrderNumber {
    pub fn new(number: u64) -> Result<Self> {
        if number == 0 || number > i64::MAX as u64 || !luhn_valid(number) {
            return Err(LedgerError::InvalidOrderNumber(number.to_string()));
        }
        Ok(OrderNumber(number))
    }

    /// Wraps a number read back from storage, where it was validated on insert.
    pub(crate) fn from_stored(number: i64) -> Self {
        OrderNumber(number as u64)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub(crate) fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl FromStr for OrderNumber {
    type Err = LedgerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::InvalidOrderNumber(trimmed.to_string()));
        }
        let number = trimmed
            .parse::<u64>()
            .map_err(|_| LedgerError::InvalidOrderNumber(trimmed.to_string()))?;
        OrderNumber::new(number)
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<OrderNumber> for String {
    fn from(number: OrderNumber) -> Self {
        number.to_string()
    }
}

/// Checks a number against the Luhn checksum.
pub fn luhn_valid(number: u64) -> bool {
    let mut remaining = number;
    let mut sum = 0u64;
    let mut double = false;

    while remaining > 0 {
        let mut digit = remaining % 10;
        if double {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
        double = !double;
        remaining /= 10;
    }

    sum % 10 == 0
}

/// Lifecycle status of an order.
///
/// `New` and `Processing` are unresolved; `Invalid` and `Processed` are
/// terminal and never revisited by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Uploaded, not yet seen by the oracle.
    New,

    /// The oracle is still calculating the reward.
    Processing,

    /// The oracle refused to calculate a reward.
    Invalid,

    /// The reward has been calculated and credited.
    Processed,
}

impl OrderStatus {
    /// Stable storage code.
    pub fn code(&self) -> i16 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Invalid => 2,
            OrderStatus::Processed => 3,
        }
    }

    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(OrderStatus::New),
            1 => Ok(OrderStatus::Processing),
            2 => Ok(OrderStatus::Invalid),
            3 => Ok(OrderStatus::Processed),
            other => Err(LedgerError::StorageFailure(format!(
                "unknown order status code {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub number: OrderNumber,
    pub owner: String,
    pub status: OrderStatus,

    /// Non-zero only once the order is `Processed`.
    pub accrual: Points,

    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// Creates a freshly uploaded order.
    pub fn new(number: OrderNumber, owner: impl Into<String>) -> Self {
        Order {
            number,
            owner: owner.into(),
            status: OrderStatus::New,
            accrual: Points::ZERO,
            uploaded_at: Utc::now(),
        }
    }
}

/// An order picked up by a reconciliation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedOrder {
    pub number: OrderNumber,
    pub owner: String,
}

/// The new status and accrual for one order, as decided by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub status: OrderStatus,
    pub accrual: Points,
}

impl Resolution {
    pub fn processed(accrual: Points) -> Self {
        Resolution {
            status: OrderStatus::Processed,
            accrual,
        }
    }

    pub fn invalid() -> Self {
        Resolution {
            status: OrderStatus::Invalid,
            accrual: Points::ZERO,
        }
    }

    pub fn processing() -> Self {
        Resolution {
            status: OrderStatus::Processing,
            accrual: Points::ZERO,
        }
    }
}
