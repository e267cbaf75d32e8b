//! In-memory ledger backend.
//!
//! All tables live behind one mutex and every operation is a short critical
//! section with no `.await` inside, which makes each call a serializable
//! transaction. Order row locks taken by a reconciliation batch are modelled
//! as a claim set released when the batch commits or is dropped.

use super::{AccountStore, OrderStore, ReconciliationBatch, Resolutions};
use crate::account::{Account, Withdrawal};
use crate::error::{LedgerError, Result};
use crate::money::Points;
use crate::order::{Order, OrderNumber, UnresolvedOrder};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    /// Orders in upload order.
    orders: Vec<Order>,
    order_index: HashMap<OrderNumber, usize>,
    accounts: BTreeMap<String, Account>,
    withdrawals: Vec<Withdrawal>,
    withdrawal_numbers: HashSet<OrderNumber>,
    claimed: HashSet<OrderNumber>,
}

impl Tables {
    fn order_mut(&mut self, number: OrderNumber) -> Option<&mut Order> {
        let idx = *self.order_index.get(&number)?;
        self.orders.get_mut(idx)
    }
}

/// In-memory implementation of the order and account stores.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_on_fetch: Arc<AtomicBool>,
    fail_on_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following batch fetch fail with a storage error.
    pub fn set_fail_on_fetch(&self, fail: bool) {
        self.fail_on_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes every following batch commit fail with a storage error.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Credits an account directly, creating it if needed.
    pub fn seed_balance(&self, owner: &str, amount: Points) -> Result<()> {
        let mut tables = self.lock()?;
        tables
            .accounts
            .entry(owner.to_string())
            .or_insert_with(|| Account::new(owner))
            .credit(amount)
    }

    /// Looks up a single order.
    pub fn order(&self, number: OrderNumber) -> Result<Option<Order>> {
        let tables = self.lock()?;
        Ok(tables
            .order_index
            .get(&number)
            .and_then(|idx| tables.orders.get(*idx))
            .cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LedgerError::StorageFailure("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn save_order(&self, owner: &str, number: OrderNumber) -> Result<()> {
        let mut tables = self.lock()?;

        if let Some(idx) = tables.order_index.get(&number) {
            let existing = &tables.orders[*idx];
            return if existing.owner == owner {
                Err(LedgerError::DuplicateOrder {
                    number: number.get(),
                })
            } else {
                Err(LedgerError::OrderOwnedByAnother {
                    number: number.get(),
                })
            };
        }

        let idx = tables.orders.len();
        tables.orders.push(Order::new(number, owner));
        tables.order_index.insert(number, idx);
        tables
            .accounts
            .entry(owner.to_string())
            .or_insert_with(|| Account::new(owner));

        debug!("Saved order {} for {}", number, owner);
        Ok(())
    }

    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>> {
        let tables = self.lock()?;
        Ok(tables
            .orders
            .iter()
            .filter(|o| o.owner == owner)
            .cloned()
            .collect())
    }

    async fn fetch_unresolved_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Box<dyn ReconciliationBatch>> {
        if self.fail_on_fetch.load(Ordering::SeqCst) {
            return Err(LedgerError::StorageFailure(
                "injected fetch failure".into(),
            ));
        }

        let mut tables = self.lock()?;

        let mut unresolved: Vec<UnresolvedOrder> = tables
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal() && !tables.claimed.contains(&o.number))
            .map(|o| UnresolvedOrder {
                number: o.number,
                owner: o.owner.clone(),
            })
            .collect();
        unresolved.sort_by_key(|o| o.number);

        let orders: Vec<UnresolvedOrder> =
            unresolved.into_iter().skip(offset).take(limit).collect();
        for order in &orders {
            tables.claimed.insert(order.number);
        }

        Ok(Box::new(MemoryBatch {
            tables: Arc::clone(&self.tables),
            fail_on_commit: Arc::clone(&self.fail_on_commit),
            orders,
            updates: Resolutions::new(),
            credits: Vec::new(),
            released: false,
        }))
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, owner: &str) -> Result<Account> {
        let tables = self.lock()?;
        tables
            .accounts
            .get(owner)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("account {}", owner)))
    }

    async fn debit(&self, owner: &str, order: OrderNumber, amount: Points) -> Result<Withdrawal> {
        let mut tables = self.lock()?;

        if tables.withdrawal_numbers.contains(&order) {
            return Err(LedgerError::DuplicateWithdrawal {
                number: order.get(),
            });
        }

        let account = tables
            .accounts
            .get_mut(owner)
            .ok_or_else(|| LedgerError::not_found(format!("account {}", owner)))?;
        account.withdraw(amount)?;

        let withdrawal = Withdrawal {
            owner: owner.to_string(),
            order,
            amount,
            processed_at: Utc::now(),
        };
        tables.withdrawal_numbers.insert(order);
        tables.withdrawals.push(withdrawal.clone());

        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        let tables = self.lock()?;
        Ok(tables
            .withdrawals
            .iter()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let tables = self.lock()?;
        Ok(tables.accounts.values().cloned().collect())
    }
}

/// Staged reconciliation updates, applied under the table lock on commit.
struct MemoryBatch {
    tables: Arc<Mutex<Tables>>,
    fail_on_commit: Arc<AtomicBool>,
    orders: Vec<UnresolvedOrder>,
    updates: Resolutions,
    credits: Vec<(String, Points)>,
    released: bool,
}

impl MemoryBatch {
    fn release(&mut self, tables: &mut Tables) {
        for order in &self.orders {
            tables.claimed.remove(&order.number);
        }
        self.released = true;
    }
}

#[async_trait]
impl ReconciliationBatch for MemoryBatch {
    fn orders(&self) -> &[UnresolvedOrder] {
        &self.orders
    }

    async fn apply_resolutions(&mut self, resolutions: &Resolutions) -> Result<()> {
        for number in resolutions.keys() {
            if !self.orders.iter().any(|o| o.number == *number) {
                return Err(LedgerError::StorageFailure(format!(
                    "order {} is not part of this batch",
                    number
                )));
            }
        }
        self.updates
            .extend(resolutions.iter().map(|(number, res)| (*number, *res)));
        Ok(())
    }

    async fn credit_available(&mut self, owner: &str, amount: Points) -> Result<()> {
        if amount.cents() < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "credit of {} must not be negative",
                amount
            )));
        }
        self.credits.push((owner.to_string(), amount));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.released {
            return Err(LedgerError::StorageFailure(
                "batch already finished".into(),
            ));
        }

        let tables_handle = Arc::clone(&self.tables);
        let mut tables = tables_handle
            .lock()
            .map_err(|_| LedgerError::StorageFailure("memory store lock poisoned".into()))?;

        if self.fail_on_commit.load(Ordering::SeqCst) {
            self.release(&mut tables);
            return Err(LedgerError::StorageFailure(
                "injected commit failure".into(),
            ));
        }

        let outcome = apply_staged(&self.updates, &self.credits, &mut tables);
        self.release(&mut tables);
        outcome
    }
}

/// Validates every staged change before touching a single row, then applies
/// them all.
fn apply_staged(
    updates: &Resolutions,
    credits: &[(String, Points)],
    tables: &mut Tables,
) -> Result<()> {
    for number in updates.keys() {
        let idx = tables
            .order_index
            .get(number)
            .ok_or_else(|| LedgerError::not_found(format!("order {}", number)))?;
        if tables.orders[*idx].status.is_terminal() {
            return Err(LedgerError::StorageFailure(format!(
                "order {} is already terminal",
                number
            )));
        }
    }

    let mut balances: BTreeMap<String, Account> = BTreeMap::new();
    for (owner, amount) in credits {
        let account = balances.entry(owner.clone()).or_insert_with(|| {
            tables
                .accounts
                .get(owner)
                .cloned()
                .unwrap_or_else(|| Account::new(owner.as_str()))
        });
        account.credit(*amount)?;
    }

    for (number, resolution) in updates {
        if let Some(order) = tables.order_mut(*number) {
            order.status = resolution.status;
            order.accrual = resolution.accrual;
        }
    }
    tables.accounts.extend(balances);
    Ok(())
}

impl Drop for MemoryBatch {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let tables_handle = Arc::clone(&self.tables);
        let mut tables = tables_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.release(&mut tables);
    }
}
