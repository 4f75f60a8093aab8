//! Process wiring: ledger, accrual client and sync loop.

use std::sync::Arc;

use tracing::info;

use crate::accrual::{AccrualClient, AccrualError, HttpAccrualClient, HttpAccrualConfig};
use crate::config::Config;
use crate::services::{SyncConfig, SyncHandle, SyncService, SyncState};
use crate::storage::{init_storage, LedgerStore, StorageError};

/// Startup failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Storage initialization failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Accrual client initialization failed: {0}")]
    Accrual(#[from] AccrualError),
}

/// A running reconciliation process.
pub struct App {
    store: Arc<dyn LedgerStore>,
    syncer: SyncHandle,
}

impl App {
    /// Connect to the ledger, build the accrual client and start syncing.
    pub async fn start(config: &Config) -> Result<Self, AppError> {
        let store = init_storage(&config.storage).await?;

        let client = HttpAccrualClient::new(
            HttpAccrualConfig::default()
                .with_base_url(config.accrual.base_url.clone())
                .with_timeout(config.accrual.timeout()),
        )?;
        info!(base_url = %config.accrual.base_url, "Accrual client configured");

        Ok(Self::with_parts(
            store,
            Arc::new(client),
            SyncConfig::from(&config.syncer),
        ))
    }

    /// Start syncing with pre-built dependencies.
    pub fn with_parts(
        store: Arc<dyn LedgerStore>,
        client: Arc<dyn AccrualClient>,
        sync_config: SyncConfig,
    ) -> Self {
        let syncer = SyncService::new(store.clone(), client, sync_config).start();
        Self { store, syncer }
    }

    /// Ledger shared with any request-serving code.
    pub fn store(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.syncer.state()
    }

    /// Stop the sync loop and wait for it to drain.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.syncer.stop().await;
        info!("Shutdown complete");
    }
}
