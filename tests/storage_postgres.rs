//! PostgreSQL ledger integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features postgres -- --nocapture
//!
//! These tests spin up PostgreSQL in a container using testcontainers-rs,
//! run migrations, and test the LedgerStore contract.

mod ledger;

use std::time::Duration;

use rust_decimal::Decimal;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use gophermart::model::OrderStatus;
use gophermart::storage::{ApplyResult, LedgerStore, PostgresLedgerStore};

use ledger::ledger_store_tests::order_number;

/// Start PostgreSQL container.
///
/// Returns (container, connection_string) where connection_string is suitable
/// for sqlx PgPool connection.
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    // PostgreSQL prints "database system is ready to accept connections" twice:
    // once during initial setup and once when fully ready.
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "gophermart")
        .with_env_var("POSTGRES_PASSWORD", "gophermart")
        .with_env_var("POSTGRES_DB", "gophermart")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!(
        "postgres://gophermart:gophermart@{}:{}/gophermart",
        host, host_port
    );

    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

/// Connect through the store's retrying connector and run migrations.
async fn connect_and_migrate(connection_string: &str) -> PostgresLedgerStore {
    let store = PostgresLedgerStore::connect(connection_string, 5)
        .await
        .expect("Failed to connect to PostgreSQL");

    store.migrate().await.expect("Failed to run migrations");

    store
}

#[tokio::test]
async fn test_postgres_ledger_store() {
    println!("=== PostgreSQL LedgerStore Tests ===");
    println!("Starting PostgreSQL container...");

    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_migrate(&connection_string).await;

    println!("Running LedgerStore tests...");
    run_ledger_store_tests!(&store);

    println!("=== All PostgreSQL LedgerStore tests PASSED ===");
    // Container is dropped here, stopping PostgreSQL
}

#[tokio::test]
async fn test_postgres_heals_partial_accrual() {
    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_migrate(&connection_string).await;

    let number = order_number(9_000);
    store.add_order(90, &number).await.unwrap();
    store
        .apply_outcome(&number, OrderStatus::Processing, None)
        .await
        .unwrap();

    // Accrual row present, order status never advanced.
    sqlx::query(
        "INSERT INTO balance_transactions (user_id, order_number, kind, amount) \
         VALUES ($1, $2, 'accrual', 500)",
    )
    .bind(90_i64)
    .bind(number.as_str())
    .execute(store.pool())
    .await
    .unwrap();

    let result = store
        .apply_outcome(&number, OrderStatus::Processed, Some(Decimal::from(500)))
        .await
        .unwrap();

    assert_eq!(result, ApplyResult::AlreadyApplied);
    assert_eq!(
        store.order(&number).await.unwrap().unwrap().status,
        OrderStatus::Processed
    );
    assert_eq!(store.transactions_for_order(&number).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_postgres_concurrent_withdrawals_never_overdraw() {
    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_migrate(&connection_string).await;

    let accrued = order_number(9_300);
    store.add_order(93, &accrued).await.unwrap();
    store
        .apply_outcome(&accrued, OrderStatus::Processed, Some(Decimal::from(100)))
        .await
        .unwrap();

    let spent = order_number(9_301);
    let (a, b, c) = tokio::join!(
        store.withdraw(93, &spent, Decimal::from(60)),
        store.withdraw(93, &spent, Decimal::from(60)),
        store.withdraw(93, &spent, Decimal::from(60)),
    );

    let succeeded = [a.is_ok(), b.is_ok(), c.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(succeeded, 1, "only one withdrawal fits the balance");

    let balance = store.balance(93).await.unwrap();
    assert_eq!(balance.current, Decimal::from(40));
    assert_eq!(balance.withdrawn, Decimal::from(60));
}
