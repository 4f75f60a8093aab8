//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod storage;
mod sync;

pub use storage::{PostgresConfig, SqliteConfig, StorageConfig, StorageType};
pub use sync::{AccrualConfig, SyncerConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "GOPHERMART_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "GOPHERMART";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "GOPHERMART_LOG";
/// Legacy environment variable for the PostgreSQL DSN.
pub const DATABASE_URI_ENV_VAR: &str = "DATABASE_URI";
/// Legacy environment variable for the accrual authority address.
pub const ACCRUAL_ADDRESS_ENV_VAR: &str = "ACCRUAL_SYSTEM_ADDRESS";

use serde::Deserialize;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Accrual authority configuration.
    pub accrual: AccrualConfig,
    /// Sync loop configuration.
    pub syncer: SyncerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy `DATABASE_URI` / `ACCRUAL_SYSTEM_ADDRESS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_legacy_env(
            std::env::var(DATABASE_URI_ENV_VAR).ok(),
            std::env::var(ACCRUAL_ADDRESS_ENV_VAR).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Apply the original service's flat environment variables.
    ///
    /// A database URI switches storage to PostgreSQL.
    fn apply_legacy_env(&mut self, database_uri: Option<String>, accrual_address: Option<String>) {
        if let Some(uri) = database_uri.filter(|s| !s.is_empty()) {
            self.storage.storage_type = StorageType::Postgres;
            self.storage.postgres.uri = uri;
        }

        if let Some(address) = accrual_address.filter(|s| !s.is_empty()) {
            let address = address.trim_end_matches('/');
            self.accrual.base_url = if address.ends_with("/api") {
                address.to_string()
            } else {
                format!("{address}/api")
            };
        }
    }

    /// Reject values the sync loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accrual.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("accrual.base_url is empty".to_string()));
        }
        if self.syncer.batch_size == 0 {
            return Err(ConfigError::Invalid("syncer.batch_size must be > 0".to_string()));
        }
        if self.syncer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "syncer.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.syncer.jitter) {
            return Err(ConfigError::Invalid(
                "syncer.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
