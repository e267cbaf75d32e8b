//! Withdrawals through the request-facing ledger, including concurrent
//! debits against one account.

use accrual_ledger::{Ledger, LedgerError, MemoryStore, Points};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Ledger with `owner` holding `available` points.
fn funded(owner: &str, available: &str) -> (Ledger, MemoryStore) {
    let store = MemoryStore::new();
    store
        .seed_balance(owner, Points::from_decimal(dec(available)).unwrap())
        .unwrap();
    (Ledger::new(Arc::new(store.clone())), store)
}

/// Withdrawal order numbers that pass the Luhn check.
const WITHDRAWAL_ORDERS: [&str; 4] = ["2377225624", "79927398713", "4561261212345467", "12345678903"];

#[tokio::test]
async fn test_withdraw_within_balance() {
    let (ledger, _) = funded("alice", "10.00");

    let withdrawal = ledger
        .withdraw("alice", "2377225624", dec("5.00"))
        .await
        .unwrap();

    assert_eq!(withdrawal.amount.cents(), 500);
    assert_eq!(withdrawal.order.get(), 2377225624);

    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, dec("5.00"));
    assert_eq!(balance.withdrawn, dec("5.00"));
}

#[tokio::test]
async fn test_withdraw_entire_balance() {
    let (ledger, _) = funded("alice", "10.00");

    ledger
        .withdraw("alice", "2377225624", dec("10.00"))
        .await
        .unwrap();

    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, Decimal::ZERO);
    assert_eq!(balance.withdrawn, dec("10.00"));
}

#[tokio::test]
async fn test_insufficient_funds_leaves_account_unchanged() {
    let (ledger, _) = funded("alice", "0.00");

    let result = ledger.withdraw("alice", "2377225624", dec("5.00")).await;

    assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, Decimal::ZERO);
    assert_eq!(balance.withdrawn, Decimal::ZERO);
    assert!(ledger.list_withdrawals("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_owner_is_not_found() {
    let (ledger, _) = funded("alice", "10.00");

    let result = ledger.withdraw("mallory", "2377225624", dec("1.00")).await;

    assert!(matches!(result, Err(LedgerError::NotFound { .. })));
}

#[tokio::test]
async fn test_rejects_bad_input_before_touching_store() {
    let (ledger, _) = funded("alice", "10.00");

    let bad_order = ledger.withdraw("alice", "2377225625", dec("1.00")).await;
    assert!(matches!(bad_order, Err(LedgerError::InvalidOrderNumber(_))));

    let negative = ledger.withdraw("alice", "2377225624", dec("-1.00")).await;
    assert!(matches!(negative, Err(LedgerError::InvalidAmount(_))));

    let dust = ledger.withdraw("alice", "2377225624", dec("0.001")).await;
    assert!(matches!(dust, Err(LedgerError::InvalidAmount(_))));

    assert_eq!(
        ledger.get_account("alice").await.unwrap().current,
        dec("10.00")
    );
}

#[tokio::test]
async fn test_withdrawal_order_is_used_once() {
    let (ledger, _) = funded("alice", "10.00");

    ledger
        .withdraw("alice", "2377225624", dec("1.00"))
        .await
        .unwrap();
    let again = ledger.withdraw("alice", "2377225624", dec("1.00")).await;

    assert!(matches!(
        again,
        Err(LedgerError::DuplicateWithdrawal { number: 2377225624 })
    ));
    assert_eq!(
        ledger.get_account("alice").await.unwrap().current,
        dec("9.00")
    );
}

#[tokio::test]
async fn test_amount_is_truncated_to_hundredths() {
    let (ledger, _) = funded("alice", "10.00");

    let withdrawal = ledger
        .withdraw("alice", "2377225624", dec("1.239"))
        .await
        .unwrap();

    assert_eq!(withdrawal.amount.cents(), 123);
    assert_eq!(
        ledger.get_account("alice").await.unwrap().current,
        dec("8.77")
    );
}

#[tokio::test]
async fn test_list_withdrawals_in_processing_order() {
    let (ledger, _) = funded("alice", "10.00");
    let (other, _) = funded("bob", "10.00");

    for (i, order) in WITHDRAWAL_ORDERS.iter().take(3).enumerate() {
        ledger
            .withdraw("alice", order, Decimal::from(i as i64 + 1))
            .await
            .unwrap();
    }
    other
        .withdraw("bob", WITHDRAWAL_ORDERS[3], dec("1"))
        .await
        .unwrap();

    let listed = ledger.list_withdrawals("alice").await.unwrap();
    let amounts: Vec<i64> = listed.iter().map(|w| w.amount.cents()).collect();
    assert_eq!(amounts, vec![100, 200, 300]);
    assert!(listed.iter().all(|w| w.owner == "alice"));

    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, dec("4.00"));
    assert_eq!(balance.withdrawn, dec("6.00"));
}

// ==================== CONCURRENCY ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_cannot_overdraw() {
    let (ledger, _) = funded("alice", "500");

    let first = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.withdraw("alice", "2377225624", dec("300")).await })
    };
    let second = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.withdraw("alice", "79927398713", dec("300")).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(refused, 1);

    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, dec("200"));
    assert_eq!(balance.withdrawn, dec("300"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_small_withdrawals_drain_exactly() {
    let (ledger, _) = funded("alice", "10.00");

    // Luhn-valid withdrawal numbers 10000..10020 with check digits.
    let orders: Vec<String> = (1000..1020u64)
        .map(|prefix| {
            (0..10)
                .map(|d| prefix * 10 + d)
                .find(|n| accrual_ledger::order::luhn_valid(*n))
                .unwrap()
                .to_string()
        })
        .collect();

    let handles: Vec<_> = orders
        .into_iter()
        .map(|order| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.withdraw("alice", &order, dec("1.00")).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 10);
    let balance = ledger.get_account("alice").await.unwrap();
    assert_eq!(balance.current, Decimal::ZERO);
    assert_eq!(balance.withdrawn, dec("10.00"));
    assert_eq!(ledger.list_withdrawals("alice").await.unwrap().len(), 10);
}
