//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! The tables themselves are created by the migrations under `migrations/`.

use sea_query::Iden;

/// Orders table schema.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "number"]
    Number,
    #[iden = "user_id"]
    UserId,
    #[iden = "status"]
    Status,
    #[iden = "accrual"]
    Accrual,
    #[iden = "uploaded_at"]
    UploadedAt,
}

/// Balance transactions table schema.
///
/// A partial unique index on `order_number WHERE kind = 'accrual'` allows at
/// most one accrual per order.
#[derive(Iden)]
pub enum BalanceTransactions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    #[iden = "order_number"]
    OrderNumber,
    #[iden = "kind"]
    Kind,
    #[iden = "amount"]
    Amount,
    #[iden = "created_at"]
    CreatedAt,
}
