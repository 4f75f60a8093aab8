//! gophermart-syncer: accrual reconciliation daemon
//!
//! Polls the order ledger for orders still awaiting an accrual decision and
//! reconciles them with the external accrual authority.
//!
//! ## Configuration
//! - GOPHERMART_CONFIG: Path to a YAML config file (optional)
//! - GOPHERMART__<SECTION>__<KEY>: Override any config value
//! - DATABASE_URI: PostgreSQL DSN (switches storage to postgres)
//! - ACCRUAL_SYSTEM_ADDRESS: Accrual authority address
//! - GOPHERMART_LOG: Log filter (default: info)

use tracing::info;

use gophermart::app::App;
use gophermart::config::Config;
use gophermart::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    info!(storage_type = ?config.storage.storage_type, "gophermart-syncer starting");

    let app = App::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    app.shutdown().await;
    Ok(())
}
