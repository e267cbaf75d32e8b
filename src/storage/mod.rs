//! Persistent order and account ledgers.
//!
//! Two backends implement the same traits: [`postgres::PostgresStore`] for
//! production and [`memory::MemoryStore`] for tests and local runs.
//!
//! Reconciliation works on a [`ReconciliationBatch`]: a handle that owns one
//! open transaction holding the selected orders locked. Status updates and the
//! matching balance credits go through that handle and become durable together
//! on [`ReconciliationBatch::commit`]. Dropping the handle rolls back.

use crate::account::{Account, Withdrawal};
use crate::error::Result;
use crate::money::Points;
use crate::order::{Order, OrderNumber, Resolution, UnresolvedOrder};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Resolutions keyed by order number, applied as one unit.
pub type Resolutions = BTreeMap<OrderNumber, Resolution>;

/// Order ledger operations.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Records a new order for `owner` and makes sure the owner has an account.
    async fn save_order(&self, owner: &str, number: OrderNumber) -> Result<()>;

    /// Orders of `owner`, oldest upload first.
    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>>;

    /// Opens a transaction and locks up to `limit` unresolved orders, ordered
    /// by number, skipping the first `offset`.
    async fn fetch_unresolved_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Box<dyn ReconciliationBatch>>;
}

/// Account ledger operations.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, owner: &str) -> Result<Account>;

    /// Moves `amount` from available to withdrawn and records the withdrawal,
    /// holding the account row locked for the whole check-and-update.
    async fn debit(&self, owner: &str, order: OrderNumber, amount: Points) -> Result<Withdrawal>;

    /// Withdrawals of `owner`, oldest first.
    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>>;

    /// All accounts ordered by owner.
    async fn list_accounts(&self) -> Result<Vec<Account>>;
}

/// A locked set of unresolved orders inside an open transaction.
#[async_trait]
pub trait ReconciliationBatch: Send {
    /// The orders selected for this batch.
    fn orders(&self) -> &[UnresolvedOrder];

    /// Updates status and accrual of every order in `resolutions`. Fails as a
    /// whole if any order is not part of the batch or is already terminal.
    async fn apply_resolutions(&mut self, resolutions: &Resolutions) -> Result<()>;

    /// Adds `amount` to the available balance of `owner`.
    async fn credit_available(&mut self, owner: &str, amount: Points) -> Result<()>;

    /// Makes every update of this batch durable and releases the locks.
    async fn commit(&mut self) -> Result<()>;
}

/// Everything the ledger facade needs from a backend.
pub trait LedgerStore: OrderStore + AccountStore {}

impl<T: OrderStore + AccountStore> LedgerStore for T {}
