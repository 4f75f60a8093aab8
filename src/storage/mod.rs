//! Ledger storage.
//!
//! The ledger exclusively owns persisted state: orders and the append-only
//! balance transaction log. The sync service keeps no durable state of its
//! own, so everything here must be safe to call again after a crash.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::model::{Balance, BalanceTransaction, Order, OrderNumber, OrderStatus};

pub(crate) mod helpers;
pub mod mock;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use mock::MockLedgerStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedgerStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderNumber),

    #[error("Invalid accrual for order {order}: {reason}")]
    InvalidAccrual { order: OrderNumber, reason: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Insufficient funds for user {user_id}: balance {available}, requested {requested}")]
    InsufficientFunds {
        user_id: i64,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage backend not enabled: {0}")]
    BackendDisabled(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Errors scoped to a single order. Everything else means the ledger
    /// itself is unreachable or misbehaving.
    pub fn is_order_specific(&self) -> bool {
        matches!(
            self,
            StorageError::OrderNotFound(_)
                | StorageError::InvalidAccrual { .. }
                | StorageError::InvalidAmount(_)
                | StorageError::InsufficientFunds { .. }
        )
    }
}

/// Outcome of [`LedgerStore::apply_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The order changed (and, for `PROCESSED`, the accrual was booked).
    Committed,
    /// Nothing to do: same status, a backward transition, or an accrual that
    /// was already booked.
    AlreadyApplied,
}

/// Outcome of [`LedgerStore::add_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOrderResult {
    Created,
    /// The same user already submitted this number.
    AlreadyUploaded,
    /// Another user owns this number.
    OwnedByAnotherUser,
}

/// Interface for the order ledger.
///
/// Implementations:
/// - `SqliteLedgerStore`: SQLite storage (default)
/// - `PostgresLedgerStore`: PostgreSQL storage
/// - `MockLedgerStore`: in-memory, for tests
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Orders whose status is `NEW` or `PROCESSING`, oldest upload first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Order>>;

    /// Move an order to `status`, booking `accrual` when it becomes
    /// `PROCESSED`.
    ///
    /// Atomic with respect to concurrent callers and idempotent: repeating a
    /// call returns `AlreadyApplied` and never books a second accrual.
    async fn apply_outcome(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<ApplyResult>;

    /// Register a newly submitted order with status `NEW`.
    async fn add_order(&self, user_id: i64, number: &OrderNumber) -> Result<AddOrderResult>;

    /// Look up a single order.
    async fn order(&self, number: &OrderNumber) -> Result<Option<Order>>;

    /// All orders for a user, newest first.
    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>>;

    /// Spend `sum` points against `number`. Fails with `InsufficientFunds`
    /// if the balance would go negative.
    async fn withdraw(
        &self,
        user_id: i64,
        number: &OrderNumber,
        sum: Decimal,
    ) -> Result<BalanceTransaction>;

    /// Current balance and total withdrawn for a user.
    async fn balance(&self, user_id: i64) -> Result<Balance>;

    /// Ledger rows referencing an order, oldest first.
    async fn transactions_for_order(&self, number: &OrderNumber) -> Result<Vec<BalanceTransaction>>;
}

/// Initialize the ledger based on configuration.
///
/// Connects (with retry), runs the embedded migrations and returns the store.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn LedgerStore>> {
    info!(storage_type = ?config.storage_type, "Initializing ledger storage");

    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            let store = SqliteLedgerStore::connect(&config.sqlite.path, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => Err(StorageError::BackendDisabled("sqlite".to_string())),
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            let store = PostgresLedgerStore::connect(&config.postgres.uri, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageType::Postgres => Err(StorageError::BackendDisabled("postgres".to_string())),
    }
}
