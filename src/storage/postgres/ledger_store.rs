//! PostgreSQL LedgerStore implementation.
//!
//! Amounts are NUMERIC and timestamps TIMESTAMPTZ. Status changes lock the
//! order row with `SELECT ... FOR UPDATE`; withdrawals serialize per user on
//! a transaction-scoped advisory lock.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_query::{
    Expr, LockType, Order as SortOrder, PostgresQueryBuilder, Query, SelectStatement,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};

use crate::model::{Balance, BalanceTransaction, Order, OrderNumber, OrderStatus, TransactionKind};
use crate::storage::helpers::{
    parse_number, parse_status, plan_apply, validate_accrual, validate_withdrawal, ApplyPlan,
};
use crate::storage::schema::{BalanceTransactions, Orders};
use crate::storage::{AddOrderResult, ApplyResult, LedgerStore, Result, StorageError};
use crate::utils::bootstrap::{connect_with_retry, redact_uri};

/// PostgreSQL implementation of LedgerStore.
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Create a new PostgreSQL ledger store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `uri`.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self> {
        let target = redact_uri(uri);
        let pool = connect_with_retry("postgres", &target, move || async move {
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(uri)
                .await
        })
        .await?;

        Ok(Self::new(pool))
    }

    /// Run the embedded PostgreSQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
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

    fn order_from_row(row: &PgRow) -> Result<Order> {
        let number: String = row.try_get("number")?;
        let status: String = row.try_get("status")?;

        Ok(Order {
            number: parse_number(&number)?,
            user_id: row.try_get("user_id")?,
            status: parse_status(&status)?,
            accrual: row.try_get("accrual")?,
            uploaded_at: row.try_get("uploaded_at")?,
        })
    }

    fn transaction_from_row(row: &PgRow) -> Result<BalanceTransaction> {
        let order_number: String = row.try_get("order_number")?;
        let kind: String = row.try_get("kind")?;

        Ok(BalanceTransaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            order_number: parse_number(&order_number)?,
            kind: kind.parse().map_err(StorageError::Corrupt)?,
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn insert_transaction(
        conn: &mut PgConnection,
        user_id: i64,
        number: &OrderNumber,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<BalanceTransaction> {
        let query = Query::insert()
            .into_table(BalanceTransactions::Table)
            .columns([
                BalanceTransactions::UserId,
                BalanceTransactions::OrderNumber,
                BalanceTransactions::Kind,
                BalanceTransactions::Amount,
            ])
            .values_panic([
                user_id.into(),
                number.as_str().into(),
                kind.as_str().into(),
                amount.into(),
            ])
            .returning(Query::returning().columns([
                BalanceTransactions::Id,
                BalanceTransactions::UserId,
                BalanceTransactions::OrderNumber,
                BalanceTransactions::Kind,
                BalanceTransactions::Amount,
                BalanceTransactions::CreatedAt,
            ]))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
        Self::transaction_from_row(&row)
    }

    async fn accrual_exists(conn: &mut PgConnection, number: &OrderNumber) -> Result<bool> {
        let query = Query::select()
            .column(BalanceTransactions::Id)
            .from(BalanceTransactions::Table)
            .and_where(Expr::col(BalanceTransactions::OrderNumber).eq(number.as_str()))
            .and_where(Expr::col(BalanceTransactions::Kind).eq(TransactionKind::Accrual.as_str()))
            .to_string(PostgresQueryBuilder);

        Ok(sqlx::query(&query).fetch_optional(&mut *conn).await?.is_some())
    }

    async fn balance_in(conn: &mut PgConnection, user_id: i64) -> Result<Balance> {
        let row = sqlx::query(
            "SELECT \
                COALESCE(SUM(amount), 0) AS current, \
                COALESCE(-SUM(amount) FILTER (WHERE kind = 'withdrawal'), 0) AS withdrawn \
             FROM balance_transactions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Balance {
            current: row.try_get("current")?,
            withdrawn: row.try_get("withdrawn")?,
        })
    }

    async fn apply_in_tx(
        conn: &mut PgConnection,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<ApplyResult> {
        let query = Query::select()
            .columns([Orders::UserId, Orders::Status])
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .lock(LockType::Update)
            .to_string(PostgresQueryBuilder);

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
                (Orders::Accrual, accrual.into()),
            ])
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&update).execute(&mut *conn).await?;

        let Some(amount) = accrual else {
            return Ok(ApplyResult::Committed);
        };

        if Self::accrual_exists(conn, number).await? {
            warn!(order = %number, "Accrual already booked for order, skipping duplicate");
            return Ok(ApplyResult::AlreadyApplied);
        }

        Self::insert_transaction(conn, user_id, number, TransactionKind::Accrual, amount).await?;

        debug!(order = %number, user_id = user_id, amount = %amount, "Accrual booked");
        Ok(ApplyResult::Committed)
    }

    async fn add_order_in_tx(
        conn: &mut PgConnection,
        user_id: i64,
        number: &OrderNumber,
    ) -> Result<AddOrderResult> {
        let insert = Query::insert()
            .into_table(Orders::Table)
            .columns([Orders::Number, Orders::UserId, Orders::Status])
            .values_panic([
                number.as_str().into(),
                user_id.into(),
                OrderStatus::New.as_str().into(),
            ])
            .on_conflict(
                sea_query::OnConflict::column(Orders::Number)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(PostgresQueryBuilder);

        let inserted = sqlx::query(&insert).execute(&mut *conn).await?;
        if inserted.rows_affected() == 1 {
            return Ok(AddOrderResult::Created);
        }

        let query = Query::select()
            .column(Orders::UserId)
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(PostgresQueryBuilder);

        let owner: i64 = sqlx::query(&query)
            .fetch_one(&mut *conn)
            .await?
            .try_get("user_id")?;

        Ok(if owner == user_id {
            AddOrderResult::AlreadyUploaded
        } else {
            AddOrderResult::OwnedByAnotherUser
        })
    }

    async fn withdraw_in_tx(
        conn: &mut PgConnection,
        user_id: i64,
        number: &OrderNumber,
        sum: Decimal,
    ) -> Result<BalanceTransaction> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

        let balance = Self::balance_in(conn, user_id).await?;
        if balance.current < sum {
            return Err(StorageError::InsufficientFunds {
                user_id,
                available: balance.current,
                requested: sum,
            });
        }

        Self::insert_transaction(conn, user_id, number, TransactionKind::Withdrawal, -sum).await
    }
}

/// A concurrent writer booked the same accrual between our check and insert.
fn is_duplicate_accrual(err: &StorageError) -> bool {
    match err {
        StorageError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(
                Expr::col(Orders::Status)
                    .is_in([OrderStatus::New.as_str(), OrderStatus::Processing.as_str()]),
            )
            .order_by(Orders::UploadedAt, SortOrder::Asc)
            .order_by(Orders::Id, SortOrder::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

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

        let mut tx = self.pool.begin().await?;
        match Self::apply_in_tx(&mut tx, number, status, accrual).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) if is_duplicate_accrual(&e) => {
                tx.rollback().await?;
                warn!(order = %number, "Concurrent accrual detected, treating as applied");
                Ok(ApplyResult::AlreadyApplied)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn add_order(&self, user_id: i64, number: &OrderNumber) -> Result<AddOrderResult> {
        let mut tx = self.pool.begin().await?;
        let result = Self::add_order_in_tx(&mut tx, user_id, number).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::UserId).eq(user_id))
            .order_by(Orders::UploadedAt, SortOrder::Desc)
            .order_by(Orders::Id, SortOrder::Desc)
            .to_string(PostgresQueryBuilder);

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

        let mut tx = self.pool.begin().await?;
        let result = Self::withdraw_in_tx(&mut tx, user_id, number, sum).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn balance(&self, user_id: i64) -> Result<Balance> {
        let mut conn = self.pool.acquire().await?;
        Self::balance_in(&mut conn, user_id).await
    }

    async fn transactions_for_order(&self, number: &OrderNumber) -> Result<Vec<BalanceTransaction>> {
        let query = Self::select_transactions()
            .and_where(Expr::col(BalanceTransactions::OrderNumber).eq(number.as_str()))
            .order_by(BalanceTransactions::Id, SortOrder::Asc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::transaction_from_row).collect()
    }
}
