//! LedgerStore interface tests.
//!
//! These tests verify the contract of the LedgerStore trait.
//! Each storage implementation should run these tests against a fresh ledger.

use rust_decimal::Decimal;

use gophermart::model::{OrderNumber, OrderStatus, TransactionKind};
use gophermart::storage::{AddOrderResult, ApplyResult, LedgerStore, StorageError};

/// Build a Luhn-valid order number from a numeric prefix.
pub fn order_number(prefix: u64) -> OrderNumber {
    let payload = prefix.to_string();
    let sum: u32 = payload
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    let check = (10 - sum % 10) % 10;
    OrderNumber::parse(&format!("{payload}{check}")).expect("generated number should be valid")
}

// =============================================================================
// LedgerStore::fetch_pending tests
// =============================================================================

/// Must run first: asserts on the whole pending set.
pub async fn test_fetch_pending_oldest_first<S: LedgerStore>(store: &S) {
    assert!(store.fetch_pending(10).await.unwrap().is_empty());

    let numbers: Vec<OrderNumber> = (0..3).map(|i| order_number(1_000 + i)).collect();
    for number in &numbers {
        store.add_order(1, number).await.unwrap();
    }

    let pending = store.fetch_pending(10).await.unwrap();
    let got: Vec<&OrderNumber> = pending.iter().map(|o| &o.number).collect();
    assert_eq!(got, numbers.iter().collect::<Vec<_>>(), "oldest submission first");
    assert!(pending.iter().all(|o| o.status == OrderStatus::New));

    let limited = store.fetch_pending(2).await.unwrap();
    assert_eq!(limited.len(), 2, "limit should bound the batch");
    assert_eq!(limited[0].number, numbers[0]);

    // Terminal orders drop out; PROCESSING stays.
    store
        .apply_outcome(&numbers[0], OrderStatus::Invalid, None)
        .await
        .unwrap();
    store
        .apply_outcome(&numbers[1], OrderStatus::Processing, None)
        .await
        .unwrap();

    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].number, numbers[1]);
    assert_eq!(pending[0].status, OrderStatus::Processing);
    assert_eq!(pending[1].number, numbers[2]);

    for number in &numbers[1..] {
        store
            .apply_outcome(number, OrderStatus::Invalid, None)
            .await
            .unwrap();
    }
    assert!(store.fetch_pending(10).await.unwrap().is_empty());
}

// =============================================================================
// LedgerStore::add_order tests
// =============================================================================

pub async fn test_add_order_and_lookup<S: LedgerStore>(store: &S) {
    let number = order_number(2_000);

    assert_eq!(store.add_order(20, &number).await.unwrap(), AddOrderResult::Created);

    let order = store
        .order(&number)
        .await
        .unwrap()
        .expect("order should exist");
    assert_eq!(order.number, number);
    assert_eq!(order.user_id, 20);
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.accrual, None);

    assert!(store.order(&order_number(2_999)).await.unwrap().is_none());
}

pub async fn test_add_order_duplicates<S: LedgerStore>(store: &S) {
    let number = order_number(2_100);
    store.add_order(21, &number).await.unwrap();

    assert_eq!(
        store.add_order(21, &number).await.unwrap(),
        AddOrderResult::AlreadyUploaded
    );
    assert_eq!(
        store.add_order(22, &number).await.unwrap(),
        AddOrderResult::OwnedByAnotherUser
    );
    assert_eq!(store.order(&number).await.unwrap().unwrap().user_id, 21);
}

pub async fn test_orders_for_user_newest_first<S: LedgerStore>(store: &S) {
    let older = order_number(2_200);
    let newer = order_number(2_201);
    store.add_order(23, &older).await.unwrap();
    store.add_order(23, &newer).await.unwrap();
    store.add_order(24, &order_number(2_202)).await.unwrap();

    let orders = store.orders_for_user(23).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].number, newer);
    assert_eq!(orders[1].number, older);
}

// =============================================================================
// LedgerStore::apply_outcome tests
// =============================================================================

pub async fn test_processed_books_accrual_once<S: LedgerStore>(store: &S) {
    let number = order_number(3_000);
    store.add_order(30, &number).await.unwrap();

    let first = store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::from(500)))
        .await
        .unwrap();
    assert_eq!(first, ApplyResult::Committed);

    let second = store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::from(500)))
        .await
        .unwrap();
    assert_eq!(second, ApplyResult::AlreadyApplied, "retry must be a no-op");

    let txs = store.transactions_for_order(&number).await.unwrap();
    assert_eq!(txs.len(), 1, "exactly one accrual per order");
    assert_eq!(txs[0].kind, TransactionKind::Accrual);
    assert_eq!(txs[0].amount, Decimal::from(500));
    assert_eq!(txs[0].user_id, 30);

    let order = store.order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(Decimal::from(500)));

    let balance = store.balance(30).await.unwrap();
    assert_eq!(balance.current, Decimal::from(500));
    assert_eq!(balance.withdrawn, Decimal::ZERO);
}

pub async fn test_processed_keeps_fractional_amount<S: LedgerStore>(store: &S) {
    let number = order_number(3_100);
    store.add_order(31, &number).await.unwrap();

    store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::new(72998, 2)))
        .await
        .unwrap();

    let txs = store.transactions_for_order(&number).await.unwrap();
    assert_eq!(txs[0].amount, Decimal::new(72998, 2));
    assert_eq!(store.balance(31).await.unwrap().current, Decimal::new(72998, 2));
}

pub async fn test_processed_with_zero_accrual<S: LedgerStore>(store: &S) {
    let number = order_number(3_150);
    store.add_order(32, &number).await.unwrap();

    let result = store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::ZERO))
        .await
        .unwrap();

    assert_eq!(result, ApplyResult::Committed);
    assert_eq!(store.transactions_for_order(&number).await.unwrap().len(), 1);
    assert_eq!(store.balance(32).await.unwrap().current, Decimal::ZERO);
}

pub async fn test_processed_requires_valid_amount<S: LedgerStore>(store: &S) {
    let number = order_number(3_200);
    store.add_order(33, &number).await.unwrap();

    let missing = store
        .apply_outcome(&number, OrderStatus::Processed, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, StorageError::InvalidAccrual { .. }));

    let negative = store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::from(-1)))
        .await
        .unwrap_err();
    assert!(matches!(negative, StorageError::InvalidAccrual { .. }));
    assert!(negative.is_order_specific());

    let order = store.order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New, "rejected outcome must not write");
    assert!(store.transactions_for_order(&number).await.unwrap().is_empty());
}

pub async fn test_invalid_is_terminal<S: LedgerStore>(store: &S) {
    let number = order_number(3_300);
    store.add_order(34, &number).await.unwrap();

    assert_eq!(
        store
            .apply_outcome(&number, OrderStatus::Invalid, None)
            .await
            .unwrap(),
        ApplyResult::Committed
    );

    for (status, accrual) in [
        (OrderStatus::Processed, Some(Decimal::from(10))),
        (OrderStatus::Processing, None),
        (OrderStatus::New, None),
    ] {
        let result = store.apply_outcome(&number, status, accrual).await.unwrap();
        assert_eq!(result, ApplyResult::AlreadyApplied);
    }

    assert_eq!(
        store.order(&number).await.unwrap().unwrap().status,
        OrderStatus::Invalid
    );
    assert!(store.transactions_for_order(&number).await.unwrap().is_empty());
}

pub async fn test_processed_is_terminal<S: LedgerStore>(store: &S) {
    let number = order_number(3_400);
    store.add_order(35, &number).await.unwrap();
    store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::from(7)))
        .await
        .unwrap();

    let result = store
        .apply_outcome(&number, OrderStatus::Invalid, None)
        .await
        .unwrap();

    assert_eq!(result, ApplyResult::AlreadyApplied);
    let order = store.order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(Decimal::from(7)));
}

pub async fn test_processing_is_idempotent<S: LedgerStore>(store: &S) {
    let number = order_number(3_500);
    store.add_order(36, &number).await.unwrap();

    assert_eq!(
        store
            .apply_outcome(&number, OrderStatus::Processing, None)
            .await
            .unwrap(),
        ApplyResult::Committed
    );
    assert_eq!(
        store
            .apply_outcome(&number, OrderStatus::Processing, None)
            .await
            .unwrap(),
        ApplyResult::AlreadyApplied
    );
    assert_eq!(
        store
            .apply_outcome(&number, OrderStatus::New, None)
            .await
            .unwrap(),
        ApplyResult::AlreadyApplied,
        "backward transition must be ignored"
    );
    assert_eq!(
        store.order(&number).await.unwrap().unwrap().status,
        OrderStatus::Processing
    );
}

pub async fn test_apply_unknown_order<S: LedgerStore>(store: &S) {
    let err = store
        .apply_outcome(&order_number(3_600), OrderStatus::Processing, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::OrderNotFound(_)));
}

pub async fn test_concurrent_apply_books_once<S: LedgerStore>(store: &S) {
    let number = order_number(3_700);
    store.add_order(37, &number).await.unwrap();
    let amount = Some(Decimal::from(250));

    let (a, b, c) = tokio::join!(
        store.apply_outcome(&number, OrderStatus::Processed, amount),
        store.apply_outcome(&number, OrderStatus::Processed, amount),
        store.apply_outcome(&number, OrderStatus::Processed, amount),
    );
    let results = [a.unwrap(), b.unwrap(), c.unwrap()];

    let committed = results
        .iter()
        .filter(|r| **r == ApplyResult::Committed)
        .count();
    assert_eq!(committed, 1, "exactly one caller should commit");
    assert_eq!(store.transactions_for_order(&number).await.unwrap().len(), 1);
    assert_eq!(store.balance(37).await.unwrap().current, Decimal::from(250));
}

// =============================================================================
// LedgerStore::withdraw / balance tests
// =============================================================================

pub async fn test_withdraw_and_balance<S: LedgerStore>(store: &S) {
    let accrued = order_number(4_000);
    let spent = order_number(4_001);
    store.add_order(40, &accrued).await.unwrap();
    store
        .apply_outcome(&accrued, OrderStatus::Processed, Some(Decimal::new(72950, 2)))
        .await
        .unwrap();

    let tx = store
        .withdraw(40, &spent, Decimal::from(500))
        .await
        .unwrap();
    assert_eq!(tx.kind, TransactionKind::Withdrawal);
    assert_eq!(tx.amount, Decimal::from(-500));
    assert_eq!(tx.user_id, 40);

    let balance = store.balance(40).await.unwrap();
    assert_eq!(balance.current, Decimal::new(22950, 2));
    assert_eq!(balance.withdrawn, Decimal::from(500));

    let err = store
        .withdraw(40, &spent, Decimal::from(500))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InsufficientFunds { .. }));
    assert_eq!(store.balance(40).await.unwrap().current, Decimal::new(22950, 2));
}

pub async fn test_withdraw_rejects_non_positive<S: LedgerStore>(store: &S) {
    let number = order_number(4_100);

    for sum in [Decimal::ZERO, Decimal::from(-10)] {
        let err = store.withdraw(41, &number, sum).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidAmount(_)));
    }
}

pub async fn test_balance_empty_user<S: LedgerStore>(store: &S) {
    let balance = store.balance(99_999).await.unwrap();
    assert_eq!(balance.current, Decimal::ZERO);
    assert_eq!(balance.withdrawn, Decimal::ZERO);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all LedgerStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_ledger_store_tests {
    ($store:expr) => {
        use $crate::ledger::ledger_store_tests::*;

        // fetch_pending tests (needs an empty ledger)
        test_fetch_pending_oldest_first($store).await;
        println!("  test_fetch_pending_oldest_first: PASSED");

        // add_order tests
        test_add_order_and_lookup($store).await;
        println!("  test_add_order_and_lookup: PASSED");

        test_add_order_duplicates($store).await;
        println!("  test_add_order_duplicates: PASSED");

        test_orders_for_user_newest_first($store).await;
        println!("  test_orders_for_user_newest_first: PASSED");

        // apply_outcome tests
        test_processed_books_accrual_once($store).await;
        println!("  test_processed_books_accrual_once: PASSED");

        test_processed_keeps_fractional_amount($store).await;
        println!("  test_processed_keeps_fractional_amount: PASSED");

        test_processed_with_zero_accrual($store).await;
        println!("  test_processed_with_zero_accrual: PASSED");

        test_processed_requires_valid_amount($store).await;
        println!("  test_processed_requires_valid_amount: PASSED");

        test_invalid_is_terminal($store).await;
        println!("  test_invalid_is_terminal: PASSED");

        test_processed_is_terminal($store).await;
        println!("  test_processed_is_terminal: PASSED");

        test_processing_is_idempotent($store).await;
        println!("  test_processing_is_idempotent: PASSED");

        test_apply_unknown_order($store).await;
        println!("  test_apply_unknown_order: PASSED");

        test_concurrent_apply_books_once($store).await;
        println!("  test_concurrent_apply_books_once: PASSED");

        // withdraw / balance tests
        test_withdraw_and_balance($store).await;
        println!("  test_withdraw_and_balance: PASSED");

        test_withdraw_rejects_non_positive($store).await;
        println!("  test_withdraw_rejects_non_positive: PASSED");

        test_balance_empty_user($store).await;
        println!("  test_balance_empty_user: PASSED");
    };
}
