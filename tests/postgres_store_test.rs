//! PostgreSQL backend tests.
//!
//! Ignored by default. Run against a scratch database with
//! `TEST_DATABASE_URL=postgres://... cargo test -- --ignored --test-threads=1`.

use accrual_ledger::order::luhn_valid;
use accrual_ledger::{
    AccountStore, LedgerError, OrderNumber, OrderStatus, OrderStore, Points, PostgresStore,
    Resolution, Resolutions,
};
use std::env;
use std::sync::Arc;

async fn store() -> PostgresStore {
    let url = env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let store = PostgresStore::connect(&url, 5).await.unwrap();
    store.init().await.unwrap();
    store
}

/// Run-unique owner name and a source of fresh Luhn-valid order numbers.
fn unique_run(tag: &str) -> (String, impl FnMut() -> OrderNumber) {
    let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap() as u64 % 1_000_000_000_000;
    let mut next = seed * 100;
    let owner = format!("{}-{}", tag, seed);
    let numbers = move || {
        next += 1;
        let n = (0..10)
            .map(|d| next * 10 + d)
            .find(|n| luhn_valid(*n))
            .unwrap();
        OrderNumber::new(n).unwrap()
    };
    (owner, numbers)
}

#[tokio::test]
#[ignore]
async fn test_save_and_list_orders() {
    let store = store().await;
    let (owner, mut numbers) = unique_run("orders");
    let first = numbers();
    let second = numbers();

    store.save_order(&owner, first).await.unwrap();
    store.save_order(&owner, second).await.unwrap();

    let orders = store.list_orders(&owner).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.status == OrderStatus::New));
    assert!(orders.iter().all(|o| o.accrual.is_zero()));

    assert!(matches!(
        store.save_order(&owner, first).await,
        Err(LedgerError::DuplicateOrder { .. })
    ));
    assert!(matches!(
        store.save_order("someone-else", first).await,
        Err(LedgerError::OrderOwnedByAnother { .. })
    ));

    let account = store.get_account(&owner).await.unwrap();
    assert!(account.available.is_zero());
}

#[tokio::test]
#[ignore]
async fn test_batch_commit_updates_orders_and_credits() {
    let store = store().await;
    let (owner, mut numbers) = unique_run("batch");
    let processed = numbers();
    let pending = numbers();
    store.save_order(&owner, processed).await.unwrap();
    store.save_order(&owner, pending).await.unwrap();

    let mut batch = store.fetch_unresolved_batch(0, 10_000).await.unwrap();
    assert!(batch.orders().iter().any(|o| o.number == processed));
    assert!(batch.orders().iter().any(|o| o.number == pending));

    let mut resolutions = Resolutions::new();
    resolutions.insert(processed, Resolution::processed(Points::from_cents(50000)));
    resolutions.insert(pending, Resolution::processing());
    batch.apply_resolutions(&resolutions).await.unwrap();
    batch
        .credit_available(&owner, Points::from_cents(50000))
        .await
        .unwrap();
    batch.commit().await.unwrap();

    let orders = store.list_orders(&owner).await.unwrap();
    let status_of = |n: OrderNumber| orders.iter().find(|o| o.number == n).unwrap().status;
    assert_eq!(status_of(processed), OrderStatus::Processed);
    assert_eq!(status_of(pending), OrderStatus::Processing);
    assert_eq!(
        store.get_account(&owner).await.unwrap().available.cents(),
        50000
    );
}

#[tokio::test]
#[ignore]
async fn test_dropped_batch_rolls_back() {
    let store = store().await;
    let (owner, mut numbers) = unique_run("rollback");
    let number = numbers();
    store.save_order(&owner, number).await.unwrap();

    {
        let mut batch = store.fetch_unresolved_batch(0, 10_000).await.unwrap();
        let mut resolutions = Resolutions::new();
        resolutions.insert(number, Resolution::processed(Points::from_cents(100)));
        batch.apply_resolutions(&resolutions).await.unwrap();
        batch
            .credit_available(&owner, Points::from_cents(100))
            .await
            .unwrap();
    }

    let orders = store.list_orders(&owner).await.unwrap();
    assert_eq!(orders[0].status, OrderStatus::New);
    assert!(store.get_account(&owner).await.unwrap().available.is_zero());
}

#[tokio::test]
#[ignore]
async fn test_debit_and_duplicate_withdrawal() {
    let store = store().await;
    let (owner, mut numbers) = unique_run("debit");
    store.save_order(&owner, numbers()).await.unwrap();
    credit(&store, &owner, 1000).await;

    let withdrawal_order = numbers();
    let withdrawal = store
        .debit(&owner, withdrawal_order, Points::from_cents(400))
        .await
        .unwrap();
    assert_eq!(withdrawal.amount.cents(), 400);

    assert!(matches!(
        store.debit(&owner, withdrawal_order, Points::from_cents(100)).await,
        Err(LedgerError::DuplicateWithdrawal { .. })
    ));
    assert!(matches!(
        store.debit(&owner, numbers(), Points::from_cents(700)).await,
        Err(LedgerError::InsufficientFunds { .. })
    ));

    let account = store.get_account(&owner).await.unwrap();
    assert_eq!(account.available.cents(), 600);
    assert_eq!(account.withdrawn.cents(), 400);
    assert_eq!(store.list_withdrawals(&owner).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_debits_serialize() {
    let store = Arc::new(store().await);
    let (owner, mut numbers) = unique_run("concurrent");
    store.save_order(&owner, numbers()).await.unwrap();
    credit(&store, &owner, 50000).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let owner = owner.clone();
            let order = numbers();
            tokio::spawn(async move { store.debit(&owner, order, Points::from_cents(30000)).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(
        store.get_account(&owner).await.unwrap().available.cents(),
        20000
    );
}

/// Credits `owner` through a reconciliation batch, the only credit path.
async fn credit(store: &PostgresStore, owner: &str, cents: i64) {
    let mut batch = store.fetch_unresolved_batch(0, 0).await.unwrap();
    batch
        .credit_available(owner, Points::from_cents(cents))
        .await
        .unwrap();
    batch.commit().await.unwrap();
}
