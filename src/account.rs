//! Account balance model and withdrawal records.
//!
//! Maintains the invariant: `available >= 0` at all times.

use crate::error::{LedgerError, Result};
use crate::money::Points;
use crate::order::OrderNumber;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Represents an owner's reward balance.
///
/// # Invariants
///
/// - `available` never goes negative: it grows only through accrual credits
///   and shrinks only through withdrawals of at most the current balance
/// - `withdrawn` is the running total of every successful withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    /// Opaque owner identity.
    pub owner: String,

    /// Points that can still be withdrawn.
    pub available: Points,

    /// Points withdrawn to date.
    pub withdrawn: Points,
}

impl Account {
    /// Creates a new account with zero balances.
    pub fn new(owner: impl Into<String>) -> Self {
        Account {
            owner: owner.into(),
            available: Points::ZERO,
            withdrawn: Points::ZERO,
        }
    }

    /// Credits accrued points to the available balance.
    pub fn credit(&mut self, amount: Points) -> Result<()> {
        if amount.cents() < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "credit of {} must not be negative",
                amount
            )));
        }
        self.available = self
            .available
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("credit of {} overflows", amount)))?;
        Ok(())
    }

    /// Withdraws points from the account.
    ///
    /// Fails with `InsufficientFunds` if `available < amount`; the account is
    /// left untouched in that case.
    pub fn withdraw(&mut self, amount: Points) -> Result<()> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "withdrawal of {} must be positive",
                amount
            )));
        }

        if self.available < amount {
            return Err(LedgerError::InsufficientFunds {
                requested: amount.to_string(),
                available: self.available.to_string(),
            });
        }

        let withdrawn = self
            .withdrawn
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("withdrawal of {} overflows", amount)))?;
        self.available = self.available.checked_sub(amount).unwrap_or(Points::ZERO);
        self.withdrawn = withdrawn;
        Ok(())
    }
}

/// A single withdrawal, recorded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withdrawal {
    pub owner: String,

    /// Caller-chosen order number identifying the withdrawal.
    pub order: OrderNumber,

    pub amount: Points,
    pub processed_at: DateTime<Utc>,
}

/// Balance as reported at the API boundary, in decimal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub current: rust_decimal::Decimal,
    pub withdrawn: rust_decimal::Decimal,
}

impl From<&Account> for Balance {
    fn from(account: &Account) -> Self {
        Balance {
            current: account.available.to_decimal(),
            withdrawn: account.withdrawn.to_decimal(),
        }
    }
}
