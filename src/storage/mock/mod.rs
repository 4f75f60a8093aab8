//! In-memory ledger for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::helpers::{plan_apply, validate_accrual, validate_withdrawal, ApplyPlan};
use super::{AddOrderResult, ApplyResult, LedgerStore, Result, StorageError};
use crate::model::{
    Balance, BalanceTransaction, Order, OrderNumber, OrderStatus, TransactionKind,
};

/// Order plus insertion sequence, used to break upload-time ties.
struct StoredOrder {
    seq: u64,
    order: Order,
}

#[derive(Default)]
struct Ledger {
    orders: HashMap<OrderNumber, StoredOrder>,
    transactions: Vec<BalanceTransaction>,
    next_seq: u64,
    next_tx_id: i64,
}

impl Ledger {
    fn accrual_exists(&self, number: &OrderNumber) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.kind == TransactionKind::Accrual && &tx.order_number == number)
    }

    fn push_transaction(
        &mut self,
        user_id: i64,
        number: &OrderNumber,
        kind: TransactionKind,
        amount: Decimal,
    ) -> BalanceTransaction {
        self.next_tx_id += 1;
        let tx = BalanceTransaction {
            id: self.next_tx_id,
            user_id,
            order_number: number.clone(),
            kind,
            amount,
            created_at: Utc::now(),
        };
        self.transactions.push(tx.clone());
        tx
    }

    fn balance(&self, user_id: i64) -> Balance {
        Balance::from_transactions(self.transactions.iter().filter(|tx| tx.user_id == user_id))
    }
}

/// Mock ledger store that keeps everything in memory.
///
/// A single lock around the whole ledger makes every write atomic.
#[derive(Default)]
pub struct MockLedgerStore {
    ledger: RwLock<Ledger>,
    fail_on_fetch: RwLock<bool>,
    fail_on_apply: RwLock<bool>,
    apply_calls: RwLock<usize>,
}

impl MockLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_fetch(&self, fail: bool) {
        *self.fail_on_fetch.write().await = fail;
    }

    pub async fn set_fail_on_apply(&self, fail: bool) {
        *self.fail_on_apply.write().await = fail;
    }

    /// Number of `apply_outcome` calls that reached the ledger.
    pub async fn apply_calls(&self) -> usize {
        *self.apply_calls.read().await
    }

    /// Write a ledger row directly, bypassing every check. Simulates state
    /// left behind by an earlier partial write.
    pub async fn inject_transaction(
        &self,
        user_id: i64,
        number: &OrderNumber,
        kind: TransactionKind,
        amount: Decimal,
    ) -> BalanceTransaction {
        self.ledger
            .write()
            .await
            .push_transaction(user_id, number, kind, amount)
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Order>> {
        if *self.fail_on_fetch.read().await {
            return Err(StorageError::Unavailable("mock fetch failure".to_string()));
        }

        let ledger = self.ledger.read().await;
        let mut pending: Vec<&StoredOrder> = ledger
            .orders
            .values()
            .filter(|s| !s.order.status.is_terminal())
            .collect();
        pending.sort_by_key(|s| (s.order.uploaded_at, s.seq));

        Ok(pending
            .into_iter()
            .take(limit)
            .map(|s| s.order.clone())
            .collect())
    }

    async fn apply_outcome(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<ApplyResult> {
        if *self.fail_on_apply.read().await {
            return Err(StorageError::Unavailable("mock apply failure".to_string()));
        }
        *self.apply_calls.write().await += 1;

        let accrual = validate_accrual(number, status, accrual)?;

        let mut ledger = self.ledger.write().await;
        let stored = ledger
            .orders
            .get_mut(number)
            .ok_or_else(|| StorageError::OrderNotFound(number.clone()))?;

        if plan_apply(number, stored.order.status, status) == ApplyPlan::Skip {
            return Ok(ApplyResult::AlreadyApplied);
        }

        stored.order.status = status;
        stored.order.accrual = accrual;
        let user_id = stored.order.user_id;

        let Some(amount) = accrual else {
            return Ok(ApplyResult::Committed);
        };

        if ledger.accrual_exists(number) {
            return Ok(ApplyResult::AlreadyApplied);
        }

        ledger.push_transaction(user_id, number, TransactionKind::Accrual, amount);
        Ok(ApplyResult::Committed)
    }

    async fn add_order(&self, user_id: i64, number: &OrderNumber) -> Result<AddOrderResult> {
        let mut ledger = self.ledger.write().await;

        if let Some(existing) = ledger.orders.get(number) {
            return Ok(if existing.order.user_id == user_id {
                AddOrderResult::AlreadyUploaded
            } else {
                AddOrderResult::OwnedByAnotherUser
            });
        }

        ledger.next_seq += 1;
        let seq = ledger.next_seq;
        ledger.orders.insert(
            number.clone(),
            StoredOrder {
                seq,
                order: Order {
                    number: number.clone(),
                    user_id,
                    status: OrderStatus::New,
                    accrual: None,
                    uploaded_at: Utc::now(),
                },
            },
        );
        Ok(AddOrderResult::Created)
    }

    async fn order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.orders.get(number).map(|s| s.order.clone()))
    }

    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>> {
        let ledger = self.ledger.read().await;
        let mut orders: Vec<&StoredOrder> = ledger
            .orders
            .values()
            .filter(|s| s.order.user_id == user_id)
            .collect();
        orders.sort_by_key(|s| std::cmp::Reverse((s.order.uploaded_at, s.seq)));
        Ok(orders.into_iter().map(|s| s.order.clone()).collect())
    }

    async fn withdraw(
        &self,
        user_id: i64,
        number: &OrderNumber,
        sum: Decimal,
    ) -> Result<BalanceTransaction> {
        validate_withdrawal(sum)?;

        let mut ledger = self.ledger.write().await;
        let balance = ledger.balance(user_id);
        if balance.current < sum {
            return Err(StorageError::InsufficientFunds {
                user_id,
                available: balance.current,
                requested: sum,
            });
        }

        Ok(ledger.push_transaction(user_id, number, TransactionKind::Withdrawal, -sum))
    }

    async fn balance(&self, user_id: i64) -> Result<Balance> {
        Ok(self.ledger.read().await.balance(user_id))
    }

    async fn transactions_for_order(&self, number: &OrderNumber) -> Result<Vec<BalanceTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .filter(|tx| &tx.order_number == number)
            .cloned()
            .collect())
    }
}
