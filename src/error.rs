//! Error types for the accrual ledger.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while reconciling accruals or moving balances.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Owner, account or order is absent
    #[error("{what} not found")]
    NotFound { what: String },

    /// Order already submitted by the same owner
    #[error("order {number} has already been submitted by this user")]
    DuplicateOrder { number: u64 },

    /// Order already submitted by a different owner
    #[error("order {number} has already been submitted by another user")]
    OrderOwnedByAnother { number: u64 },

    /// Withdrawal order number already used
    #[error("withdrawal for order {number} has already been recorded")]
    DuplicateWithdrawal { number: u64 },

    /// Debit exceeds the available balance
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: String, available: String },

    /// Order number failed syntax or Luhn validation
    #[error("invalid order number: {0}")]
    InvalidOrderNumber(String),

    /// Amount is negative, zero where not allowed, or out of range
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Transport-level failure talking to the accrual oracle
    #[error("accrual oracle unavailable: {0}")]
    OracleUnavailable(#[from] reqwest::Error),

    /// Oracle answered with a status token we do not recognize
    #[error("accrual oracle returned undefined status {0:?}")]
    OracleUndefinedStatus(String),

    /// Database error
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Non-SQL storage failure
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Scheduler was started twice
    #[error("reconciliation scheduler is already running")]
    AlreadyRunning,

    /// Scheduler was stopped without being started
    #[error("reconciliation scheduler is not running")]
    NotRunning,

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Unknown command line usage
    #[error("Usage: accrual-ledger [balances] [config.toml]")]
    MissingArgument,
}

impl LedgerError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound { what: what.into() }
    }

    /// Returns `true` for errors that a user-facing layer should report
    /// verbatim; everything else is internal.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound { .. }
                | LedgerError::DuplicateOrder { .. }
                | LedgerError::OrderOwnedByAnother { .. }
                | LedgerError::DuplicateWithdrawal { .. }
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::InvalidOrderNumber(_)
                | LedgerError::InvalidAmount(_)
        )
    }
}
