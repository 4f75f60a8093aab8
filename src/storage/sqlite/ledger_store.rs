//! SQLite LedgerStore implementation.
//!
//! Amounts are stored as decimal strings and summed in Rust; SQLite has no
//! exact numeric type. Timestamps are fixed-width RFC 3339 text so that
//! ordering by `uploaded_at` is chronological.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_query::{Expr, Order as SortOrder, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::model::{
    Balance, BalanceTransaction, Order, OrderNumber, OrderStatus, TransactionKind,
};
use crate::storage::helpers::{
    format_timestamp, parse_decimal, parse_number, parse_status, parse_timestamp, plan_apply,
    validate_accrual, validate_withdrawal, ApplyPlan,
};
use crate::storage::schema::{BalanceTransactions, Orders};
use crate::storage::{AddOrderResult, ApplyResult, LedgerStore, Result, StorageError};
use crate::utils::bootstrap::connect_with_retry;

/// SQLite implementation of LedgerStore.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a new SQLite ledger store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn connect(path: &str, max_connections: u32) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = connect_with_retry("sqlite", path, || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
            }
        })
        .await?;

        Ok(Self::new(pool))
    }

    /// Run the embedded SQLite migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn select_orders() -> SelectStatement {
        Query::select()
            .columns([
                Orders::Number,
                Orders::UserId,
                Orders::Status,
                Orders::Accrual,
                Orders::UploadedAt,
            ])
            .from(Orders::Table)
            .to_owned()
    }

    fn select_transactions() -> SelectStatement {
        Query::select()
            .columns([
                BalanceTransactions::Id,
                BalanceTransactions::UserId,
                BalanceTransactions::OrderNumber,
                BalanceTransactions::Kind,
                BalanceTransactions::Amount,
                BalanceTransactions::CreatedAt,
            ])
            .from(BalanceTransactions::Table)
            .to_owned()
    }

    fn order_from_row(row: &SqliteRow) -> Result<Order> {
        let number: String = row.try_get("number")?;
        let status: String = row.try_get("status")?;
        let accrual: Option<String> = row.try_get("accrual")?;
        let uploaded_at: String = row.try_get("uploaded_at")?;

        Ok(Order {
            number: parse_number(&number)?,
            user_id: row.try_get("user_id")?,
            status: parse_status(&status)?,
            accrual: accrual.as_deref().map(parse_decimal).transpose()?,
            uploaded_at: parse_timestamp(&uploaded_at)?,
        })
    }

    fn transaction_from_row(row: &SqliteRow) -> Result<BalanceTransaction> {
        let order_number: String = row.try_get("order_number")?;
        let kind: String = row.try_get("kind")?;
        let amount: String = row.try_get("amount")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(BalanceTransaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            order_number: parse_number(&order_number)?,
            kind: kind.parse().map_err(StorageError::Corrupt)?,
            amount: parse_decimal(&amount)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    /// Take the database write lock up front.
    ///
    /// BEGIN IMMEDIATE prevents deadlocks when concurrent DEFERRED
    /// transactions race to upgrade from shared to exclusive.
    async fn begin_immediate(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(())
    }

    /// Commit on success, roll back on failure.
    ///
    /// A failed COMMIT is rolled back too, so the connection never returns
    /// to the pool inside an open transaction.
    async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => return Ok(value),
                Err(e) => {
                    warn!(error = %e, "Ledger commit failed, rolling back");
                    StorageError::from(e)
                }
            },
            Err(e) => e,
        };

        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            warn!(error = %e, "Failed to roll back ledger transaction");
        }
        Err(err)
    }

    async fn accrual_exists(conn: &mut SqliteConnection, number: &OrderNumber) -> Result<bool> {
        let query = Query::select()
            .column(BalanceTransactions::Id)
            .from(BalanceTransactions::Table)
            .and_where(Expr::col(BalanceTransactions::OrderNumber).eq(number.as_str()))
            .and_where(Expr::col(BalanceTransactions::Kind).eq(TransactionKind::Accrual.as_str()))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query).fetch_optional(&mut *conn).await?.is_some())
    }

    async fn insert_transaction(
        conn: &mut SqliteConnection,
        user_id: i64,
        number: &OrderNumber,
        kind: TransactionKind,
        amount: Decimal,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let query = Query::insert()
            .into_table(BalanceTransactions::Table)
            .columns([
                BalanceTransactions::UserId,
                BalanceTransactions::OrderNumber,
                BalanceTransactions::Kind,
                BalanceTransactions::Amount,
                BalanceTransactions::CreatedAt,
            ])
            .values_panic([
                user_id.into(),
                number.as_str().into(),
                kind.as_str().into(),
                amount.to_string().into(),
                format_timestamp(created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.last_insert_rowid())
    }

    async fn user_transactions(
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<Vec<BalanceTransaction>> {
        let query = Self::select_transactions()
            .and_where(Expr::col(BalanceTransactions::UserId).eq(user_id))
            .order_by(BalanceTransactions::Id, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
        rows.iter().map(Self::transaction_from_row).collect()
    }

    async fn apply_in_tx(
        conn: &mut SqliteConnection,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<ApplyResult> {
        let query = Query::select()
            .columns([Orders::UserId, Orders::Status])
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StorageError::OrderNotFound(number.clone()))?;

        let user_id: i64 = row.try_get("user_id")?;
        let current = parse_status(&row.try_get::<String, _>("status")?)?;

        if plan_apply(number, current, status) == ApplyPlan::Skip {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let update = Query::update()
            .table(Orders::Table)
            .values([
                (Orders::Status, status.as_str().into()),
                (Orders::Accrual, accrual.map(|a| a.to_string()).into()),
            ])
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&update).execute(&mut *conn).await?;

        let Some(amount) = accrual else {
            return Ok(ApplyResult::Committed);
        };

        if Self::accrual_exists(conn, number).await? {
            warn!(order = %number, "Accrual already booked for order, skipping duplicate");
            return Ok(ApplyResult::AlreadyApplied);
        }

        Self::insert_transaction(
            conn,
            user_id,
            number,
            TransactionKind::Accrual,
            amount,
            Utc::now(),
        )
        .await?;

        debug!(order = %number, user_id = user_id, amount = %amount, "Accrual booked");
        Ok(ApplyResult::Committed)
    }

    async fn add_order_in_tx(
        conn: &mut SqliteConnection,
        user_id: i64,
        number: &OrderNumber,
    ) -> Result<AddOrderResult> {
        let query = Query::select()
            .column(Orders::UserId)
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(SqliteQueryBuilder);

        if let Some(row) = sqlx::query(&query).fetch_optional(&mut *conn).await? {
            let owner: i64 = row.try_get("user_id")?;
            return Ok(if owner == user_id {
                AddOrderResult::AlreadyUploaded
            } else {
                AddOrderResult::OwnedByAnotherUser
            });
        }

        let insert = Query::insert()
            .into_table(Orders::Table)
            .columns([
                Orders::Number,
                Orders::UserId,
                Orders::Status,
                Orders::UploadedAt,
            ])
            .values_panic([
                number.as_str().into(),
                user_id.into(),
                OrderStatus::New.as_str().into(),
                format_timestamp(Utc::now()).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&mut *conn).await?;
        Ok(AddOrderResult::Created)
    }

    async fn withdraw_in_tx(
        conn: &mut SqliteConnection,
        user_id: i64,
        number: &OrderNumber,
        sum: Decimal,
    ) -> Result<BalanceTransaction> {
        let balance = Balance::from_transactions(&Self::user_transactions(conn, user_id).await?);
        if balance.current < sum {
            return Err(StorageError::InsufficientFunds {
                user_id,
                available: balance.current,
                requested: sum,
            });
        }

        let created_at = Utc::now();
        let id = Self::insert_transaction(
            conn,
            user_id,
            number,
            TransactionKind::Withdrawal,
            -sum,
            created_at,
        )
        .await?;

        Ok(BalanceTransaction {
            id,
            user_id,
            order_number: number.clone(),
            kind: TransactionKind::Withdrawal,
            amount: -sum,
            created_at,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(
                Expr::col(Orders::Status)
                    .is_in([OrderStatus::New.as_str(), OrderStatus::Processing.as_str()]),
            )
            .order_by(Orders::UploadedAt, SortOrder::Asc)
            .order_by(Orders::Id, SortOrder::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::order_from_row).collect()
    }

    async fn apply_outcome(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<ApplyResult> {
        let accrual = validate_accrual(number, status, accrual)?;

        let mut conn = self.pool.acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::apply_in_tx(&mut conn, number, status, accrual).await;
        Self::finish(&mut conn, result).await
    }

    async fn add_order(&self, user_id: i64, number: &OrderNumber) -> Result<AddOrderResult> {
        let mut conn = self.pool.acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::add_order_in_tx(&mut conn, user_id, number).await;
        Self::finish(&mut conn, result).await
    }

    async fn order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::UserId).eq(user_id))
            .order_by(Orders::UploadedAt, SortOrder::Desc)
            .order_by(Orders::Id, SortOrder::Desc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::order_from_row).collect()
    }

    async fn withdraw(
        &self,
        user_id: i64,
        number: &OrderNumber,
        sum: Decimal,
    ) -> Result<BalanceTransaction> {
        validate_withdrawal(sum)?;

        let mut conn = self.pool.acquire().await?;
        Self::begin_immediate(&mut conn).await?;
        let result = Self::withdraw_in_tx(&mut conn, user_id, number, sum).await;
        Self::finish(&mut conn, result).await
    }

    async fn balance(&self, user_id: i64) -> Result<Balance> {
        let mut conn = self.pool.acquire().await?;
        let txs = Self::user_transactions(&mut conn, user_id).await?;
        Ok(Balance::from_transactions(&txs))
    }

    async fn transactions_for_order(&self, number: &OrderNumber) -> Result<Vec<BalanceTransaction>> {
        let query = Self::select_transactions()
            .and_where(Expr::col(BalanceTransactions::OrderNumber).eq(number.as_str()))
            .order_by(BalanceTransactions::Id, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::transaction_from_row).collect()
    }
}
