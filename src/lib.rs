//! # Accrual Ledger
//!
//! A loyalty-points ledger. Users submit purchase order numbers, an external
//! accrual oracle decides how much reward each order earns, and users withdraw
//! the accumulated balance.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: amounts are integer hundredths, decimals only
//!   at the boundaries
//! - **Atomic reconciliation**: an order's terminal status and its owner's
//!   credit are committed in the same transaction
//! - **Strict invariants**: `available >= 0` always; concurrent withdrawals
//!   serialize on the account row
//! - **Single scheduler**: one background loop per process, owned by a
//!   [`Scheduler`] value
//!
//! ## Example
//!
//! ```no_run
//! use accrual_ledger::{HttpAccrualOracle, Ledger, MemoryStore, Reconciler, Scheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> accrual_ledger::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let oracle = Arc::new(HttpAccrualOracle::new("http://localhost:8081", Duration::from_secs(5))?);
//!
//! let mut scheduler = Scheduler::new(
//!     Reconciler::new(store.clone(), oracle, 10),
//!     Duration::from_secs(1),
//! );
//! scheduler.start()?;
//!
//! let ledger = Ledger::new(store);
//! ledger.submit_order("alice", "79927398713").await?;
//!
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod config;
pub mod error;
pub mod ledger;
pub mod money;
pub mod oracle;
pub mod order;
pub mod scheduler;
pub mod storage;

pub use account::{Account, Balance, Withdrawal};
pub use config::Config;
pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use money::{to_decimal, to_fixed_point, Points};
pub use oracle::{AccrualOracle, HttpAccrualOracle, OracleReply, Outcome};
pub use order::{Order, OrderNumber, OrderStatus, Resolution, UnresolvedOrder};
pub use scheduler::{PassSummary, Reconciler, Scheduler};
pub use storage::{
    AccountStore, LedgerStore, MemoryStore, OrderStore, PostgresStore, ReconciliationBatch,
    Resolutions,
};
