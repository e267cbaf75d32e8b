//! PostgreSQL ledger backend.
//!
//! Every multi-statement mutation runs in one transaction with the affected
//! rows locked. Batches use `FOR UPDATE SKIP LOCKED`, so several instances can
//! drain the same backlog without handing one order to two of them.

use super::{AccountStore, OrderStore, ReconciliationBatch, Resolutions};
use crate::account::{Account, Withdrawal};
use crate::error::{LedgerError, Result};
use crate::money::Points;
use crate::order::{Order, OrderNumber, OrderStatus, UnresolvedOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

const CREATE_TABLES: [&str; 3] = [
    r#"CREATE TABLE IF NOT EXISTS orders (
        number BIGINT PRIMARY KEY,
        owner TEXT NOT NULL,
        status SMALLINT NOT NULL DEFAULT 0,
        accrual BIGINT NOT NULL DEFAULT 0,
        uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS accounts (
        owner TEXT PRIMARY KEY,
        available BIGINT NOT NULL DEFAULT 0 CHECK (available >= 0),
        withdrawn BIGINT NOT NULL DEFAULT 0 CHECK (withdrawn >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS withdrawals (
        number BIGINT PRIMARY KEY,
        owner TEXT NOT NULL,
        amount BIGINT NOT NULL CHECK (amount > 0),
        processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
];

const INSERT_ORDER: &str =
    "INSERT INTO orders (number, owner) VALUES ($1, $2) ON CONFLICT (number) DO NOTHING";
const SELECT_ORDER_OWNER: &str = "SELECT owner FROM orders WHERE number = $1";
const ENSURE_ACCOUNT: &str =
    "INSERT INTO accounts (owner) VALUES ($1) ON CONFLICT (owner) DO NOTHING";
const SELECT_ORDERS_OF_OWNER: &str = "SELECT number, owner, status, accrual, uploaded_at \
     FROM orders WHERE owner = $1 ORDER BY uploaded_at ASC, number ASC";
const SELECT_UNRESOLVED: &str = "SELECT number, owner FROM orders WHERE status IN (0, 1) \
     ORDER BY number OFFSET $1 LIMIT $2 FOR UPDATE SKIP LOCKED";
const UPDATE_ORDER: &str =
    "UPDATE orders SET status = $2, accrual = $3 WHERE number = $1 AND status IN (0, 1)";
const CREDIT_ACCOUNT: &str = "INSERT INTO accounts (owner, available) VALUES ($1, $2) \
     ON CONFLICT (owner) DO UPDATE SET available = accounts.available + EXCLUDED.available";
const SELECT_ACCOUNT: &str = "SELECT owner, available, withdrawn FROM accounts WHERE owner = $1";
const SELECT_ACCOUNT_FOR_UPDATE: &str =
    "SELECT owner, available, withdrawn FROM accounts WHERE owner = $1 FOR UPDATE";
const UPDATE_ACCOUNT: &str =
    "UPDATE accounts SET available = $2, withdrawn = $3 WHERE owner = $1";
const INSERT_WITHDRAWAL: &str = "INSERT INTO withdrawals (number, owner, amount) \
     VALUES ($1, $2, $3) RETURNING processed_at";
const SELECT_WITHDRAWALS_OF_OWNER: &str = "SELECT number, owner, amount, processed_at \
     FROM withdrawals WHERE owner = $1 ORDER BY processed_at ASC, number ASC";
const SELECT_ACCOUNTS: &str = "SELECT owner, available, withdrawn FROM accounts ORDER BY owner";

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL implementation of the order and account stores.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the ledger tables if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        for statement in CREATE_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("ledger schema ready");
        Ok(())
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        owner: row.try_get("owner")?,
        available: Points::from_cents(row.try_get("available")?),
        withdrawn: Points::from_cents(row.try_get("withdrawn")?),
    })
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    Ok(Order {
        number: OrderNumber::from_stored(row.try_get("number")?),
        owner: row.try_get("owner")?,
        status: OrderStatus::from_code(row.try_get("status")?)?,
        accrual: Points::from_cents(row.try_get("accrual")?),
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn save_order(&self, owner: &str, number: OrderNumber) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(INSERT_ORDER)
            .bind(number.as_i64())
            .bind(owner)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted == 0 {
            let existing: String = sqlx::query_scalar(SELECT_ORDER_OWNER)
                .bind(number.as_i64())
                .fetch_one(&mut *tx)
                .await?;
            return if existing == owner {
                Err(LedgerError::DuplicateOrder {
                    number: number.get(),
                })
            } else {
                Err(LedgerError::OrderOwnedByAnother {
                    number: number.get(),
                })
            };
        }

        sqlx::query(ENSURE_ACCOUNT)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Saved order {} for {}", number, owner);
        Ok(())
    }

    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(SELECT_ORDERS_OF_OWNER)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn fetch_unresolved_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Box<dyn ReconciliationBatch>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(SELECT_UNRESOLVED)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let orders = rows
            .iter()
            .map(|row| {
                Ok(UnresolvedOrder {
                    number: OrderNumber::from_stored(row.try_get("number")?),
                    owner: row.try_get("owner")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Box::new(PostgresBatch {
            tx: Some(tx),
            orders,
        }))
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    async fn get_account(&self, owner: &str) -> Result<Account> {
        let row = sqlx::query(SELECT_ACCOUNT)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("account {}", owner)))?;
        account_from_row(&row)
    }

    async fn debit(&self, owner: &str, order: OrderNumber, amount: Points) -> Result<Withdrawal> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(SELECT_ACCOUNT_FOR_UPDATE)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("account {}", owner)))?;
        let mut account = account_from_row(&row)?;
        account.withdraw(amount)?;

        sqlx::query(UPDATE_ACCOUNT)
            .bind(owner)
            .bind(account.available.cents())
            .bind(account.withdrawn.cents())
            .execute(&mut *tx)
            .await?;

        let processed_at: DateTime<Utc> = sqlx::query_scalar(INSERT_WITHDRAWAL)
            .bind(order.as_i64())
            .bind(owner)
            .bind(amount.cents())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::DuplicateWithdrawal {
                        number: order.get(),
                    }
                } else {
                    LedgerError::Storage(e)
                }
            })?;

        tx.commit().await?;

        Ok(Withdrawal {
            owner: owner.to_string(),
            order,
            amount,
            processed_at,
        })
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(SELECT_WITHDRAWALS_OF_OWNER)
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Withdrawal {
                    order: OrderNumber::from_stored(row.try_get("number")?),
                    owner: row.try_get("owner")?,
                    amount: Points::from_cents(row.try_get("amount")?),
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(SELECT_ACCOUNTS).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }
}

/// An open transaction holding a set of unresolved orders locked.
struct PostgresBatch {
    tx: Option<Transaction<'static, Postgres>>,
    orders: Vec<UnresolvedOrder>,
}

impl PostgresBatch {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| LedgerError::StorageFailure("batch already finished".into()))
    }
}

#[async_trait]
impl ReconciliationBatch for PostgresBatch {
    fn orders(&self) -> &[UnresolvedOrder] {
        &self.orders
    }

    async fn apply_resolutions(&mut self, resolutions: &Resolutions) -> Result<()> {
        for (number, resolution) in resolutions {
            if !self.orders.iter().any(|o| o.number == *number) {
                return Err(LedgerError::StorageFailure(format!(
                    "order {} is not part of this batch",
                    number
                )));
            }

            let tx = self.tx()?;
            let updated = sqlx::query(UPDATE_ORDER)
                .bind(number.as_i64())
                .bind(resolution.status.code())
                .bind(resolution.accrual.cents())
                .execute(&mut **tx)
                .await?
                .rows_affected();

            if updated != 1 {
                return Err(LedgerError::StorageFailure(format!(
                    "order {} is no longer unresolved",
                    number
                )));
            }
        }
        Ok(())
    }

    async fn credit_available(&mut self, owner: &str, amount: Points) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(CREDIT_ACCOUNT)
            .bind(owner)
            .bind(amount.cents())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerError::StorageFailure("batch already finished".into()))?;
        tx.commit().await?;
        Ok(())
    }
}
