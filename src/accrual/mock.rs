//! Scripted accrual client for testing.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{AccrualClient, AccrualError, AccrualOutcome, Result};
use crate::model::OrderNumber;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    Registered,
    Processing,
    Invalid,
    Processed(Decimal),
    RateLimited(Duration),
    NotRegistered,
    Transient,
}

impl MockReply {
    fn into_result(self, order: &OrderNumber) -> Result<AccrualOutcome> {
        match self {
            MockReply::Registered => Ok(AccrualOutcome::registered(order.clone())),
            MockReply::Processing => Ok(AccrualOutcome::processing(order.clone())),
            MockReply::Invalid => Ok(AccrualOutcome::invalid(order.clone())),
            MockReply::Processed(amount) => Ok(AccrualOutcome::processed(order.clone(), amount)),
            MockReply::RateLimited(retry_after) => Err(AccrualError::RateLimited { retry_after }),
            MockReply::NotRegistered => Err(AccrualError::NotRegistered(order.clone())),
            MockReply::Transient => Err(AccrualError::Transient("mock failure".to_string())),
        }
    }
}

/// A recorded call.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub order: OrderNumber,
    pub at: Instant,
}

/// Mock accrual client.
///
/// Replies are consumed per order in the order they were scripted. The last
/// reply for an order is sticky once the queue runs down to it. Orders with
/// no script answer `NotRegistered`.
#[derive(Default)]
pub struct MockAccrualClient {
    scripts: RwLock<HashMap<OrderNumber, VecDeque<MockReply>>>,
    calls: RwLock<Vec<RecordedQuery>>,
}

impl MockAccrualClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append replies for `order`.
    pub async fn script(&self, order: &OrderNumber, replies: impl IntoIterator<Item = MockReply>) {
        self.scripts
            .write()
            .await
            .entry(order.clone())
            .or_default()
            .extend(replies);
    }

    /// All queries seen so far, in call order.
    pub async fn calls(&self) -> Vec<RecordedQuery> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }
}

#[async_trait]
impl AccrualClient for MockAccrualClient {
    async fn query(&self, order: &OrderNumber) -> Result<AccrualOutcome> {
        self.calls.write().await.push(RecordedQuery {
            order: order.clone(),
            at: Instant::now(),
        });

        let reply = {
            let mut scripts = self.scripts.write().await;
            match scripts.get_mut(order) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        reply
            .unwrap_or(MockReply::NotRegistered)
            .into_result(order)
    }
}
