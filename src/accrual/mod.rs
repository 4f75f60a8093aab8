//! Accrual authority client interface.
//!
//! The authority computes loyalty rewards asynchronously and reports an
//! order's processing status on request. It also rate-limits callers.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::model::{OrderNumber, OrderStatus};

pub mod http;
pub mod mock;

pub use http::{HttpAccrualClient, HttpAccrualConfig};
pub use mock::MockAccrualClient;

/// Result type for accrual queries.
pub type Result<T> = std::result::Result<T, AccrualError>;

/// Processing status as reported by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    /// Local order status this report moves the order to.
    pub fn order_status(&self) -> OrderStatus {
        match self {
            AccrualStatus::Registered | AccrualStatus::Processing => OrderStatus::Processing,
            AccrualStatus::Invalid => OrderStatus::Invalid,
            AccrualStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// A successful answer from the authority.
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualOutcome {
    pub order: OrderNumber,
    pub status: AccrualStatus,
    /// Non-negative; present only when `status` is `Processed`.
    pub accrual: Option<Decimal>,
}

impl AccrualOutcome {
    pub fn registered(order: OrderNumber) -> Self {
        Self {
            order,
            status: AccrualStatus::Registered,
            accrual: None,
        }
    }

    pub fn processing(order: OrderNumber) -> Self {
        Self {
            order,
            status: AccrualStatus::Processing,
            accrual: None,
        }
    }

    pub fn invalid(order: OrderNumber) -> Self {
        Self {
            order,
            status: AccrualStatus::Invalid,
            accrual: None,
        }
    }

    pub fn processed(order: OrderNumber, accrual: Decimal) -> Self {
        Self {
            order,
            status: AccrualStatus::Processed,
            accrual: Some(accrual),
        }
    }
}

/// Non-success answers from the authority.
#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    /// The caller must not issue another query before `retry_after` elapses.
    #[error("Rate limited by accrual authority, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The authority has no record of the order yet.
    #[error("Order {0} not registered with accrual authority")]
    NotRegistered(OrderNumber),

    /// Network failure or server-side error.
    #[error("Transient accrual authority failure: {0}")]
    Transient(String),

    /// Response body could not be understood.
    #[error("Failed to decode accrual response: {0}")]
    Decode(String),
}

impl AccrualError {
    /// Errors that should slow the poll loop down.
    pub fn is_transient(&self) -> bool {
        matches!(self, AccrualError::Transient(_) | AccrualError::Decode(_))
    }
}

/// Interface to the accrual authority.
///
/// Implementations hold no per-call state: each query is independent.
///
/// Implementations:
/// - `HttpAccrualClient`: the authority's HTTP contract
/// - `MockAccrualClient`: scripted responses for tests
#[async_trait]
pub trait AccrualClient: Send + Sync {
    /// Ask the authority for the current state of one order.
    async fn query(&self, order: &OrderNumber) -> Result<AccrualOutcome>;
}
