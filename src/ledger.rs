//! Inbound operations on the ledger.
//!
//! [`Ledger`] is what a request-handling layer talks to: it validates caller
//! input, converts decimal amounts to fixed-point and delegates to the store.

use crate::account::{Balance, Withdrawal};
use crate::error::{LedgerError, Result};
use crate::money::Points;
use crate::order::{Order, OrderNumber};
use crate::storage::LedgerStore;
use log::{debug, info};
use rust_decimal::Decimal;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

/// Request-facing ledger operations.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Ledger { store }
    }

    /// Registers an order number for reward evaluation.
    pub async fn submit_order(&self, owner: &str, number: &str) -> Result<OrderNumber> {
        let number = OrderNumber::from_str(number)?;
        self.store.save_order(owner, number).await?;
        info!("Order {} submitted by {}", number, owner);
        Ok(number)
    }

    pub async fn list_orders(&self, owner: &str) -> Result<Vec<Order>> {
        self.store.list_orders(owner).await
    }

    /// Current and withdrawn balance of `owner`.
    pub async fn get_account(&self, owner: &str) -> Result<Balance> {
        let account = self.store.get_account(owner).await?;
        Ok(Balance::from(&account))
    }

    /// Withdraws `amount` points against the withdrawal order `order`.
    ///
    /// On success the withdrawal is recorded and the available balance has
    /// dropped by exactly `amount` (truncated to hundredths).
    pub async fn withdraw(&self, owner: &str, order: &str, amount: Decimal) -> Result<Withdrawal> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "withdrawal of {} must be positive",
                amount
            )));
        }
        let order = OrderNumber::from_str(order)?;
        let points = Points::from_decimal(amount)?;
        if !points.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "withdrawal of {} is below the smallest unit",
                amount
            )));
        }

        match self.store.debit(owner, order, points).await {
            Ok(withdrawal) => {
                info!("Withdrew {} from {} for order {}", points, owner, order);
                Ok(withdrawal)
            }
            Err(e) => {
                debug!(
                    "Withdrawal of {} from {} for order {} failed: {}",
                    points, owner, order, e
                );
                Err(e)
            }
        }
    }

    pub async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        self.store.list_withdrawals(owner).await
    }

    /// Writes every account balance as CSV.
    ///
    /// Output is sorted by owner for deterministic results. All amounts are
    /// formatted with exactly 2 decimal places.
    pub async fn write_balances<W: Write>(&self, writer: W) -> Result<()> {
        let mut accounts = self.store.list_accounts().await?;
        accounts.sort_by(|a, b| a.owner.cmp(&b.owner));

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["owner", "available", "withdrawn"])?;
        for account in accounts {
            csv_writer.write_record([
                account.owner.clone(),
                account.available.to_string(),
                account.withdrawn.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ledger_with_store() -> (Ledger, MemoryStore) {
        let store = MemoryStore::new();
        (Ledger::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_submit_validates_luhn() {
        let (ledger, _) = ledger_with_store();
        assert!(matches!(
            ledger.submit_order("alice", "79927398710").await,
            Err(LedgerError::InvalidOrderNumber(_))
        ));

        let number = ledger.submit_order("alice", "79927398713").await.unwrap();
        assert_eq!(number.get(), 79927398713);
        assert_eq!(ledger.list_orders("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_rejects_non_positive_amount() {
        let (ledger, store) = ledger_with_store();
        store.seed_balance("alice", Points::from_cents(1000)).unwrap();

        for amount in ["0", "-1", "0.001"] {
            assert!(matches!(
                ledger.withdraw("alice", "79927398713", dec(amount)).await,
                Err(LedgerError::InvalidAmount(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_withdraw_rejects_invalid_order_reference() {
        let (ledger, store) = ledger_with_store();
        store.seed_balance("alice", Points::from_cents(1000)).unwrap();

        assert!(matches!(
            ledger.withdraw("alice", "12345", dec("1")).await,
            Err(LedgerError::InvalidOrderNumber(_))
        ));
        assert_eq!(
            ledger.get_account("alice").await.unwrap().current,
            dec("10.00")
        );
    }

    #[tokio::test]
    async fn test_write_balances_sorted() {
        let (ledger, store) = ledger_with_store();
        store.seed_balance("zoe", Points::from_cents(150)).unwrap();
        store.seed_balance("adam", Points::from_cents(1000)).unwrap();
        ledger
            .withdraw("adam", "79927398713", dec("2.5"))
            .await
            .unwrap();

        let mut output = Vec::new();
        ledger.write_balances(&mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(
            output,
            "owner,available,withdrawn\nadam,7.50,2.50\nzoe,1.50,0.00\n"
        );
    }
}
