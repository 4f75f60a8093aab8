//! Accrual authority and sync loop configuration.

use std::time::Duration;

use serde::Deserialize;

/// Accrual authority client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    /// Base URL; the client requests `{base_url}/orders/{number}`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/api".to_string(),
            timeout_secs: 10,
        }
    }
}

impl AccrualConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Sync loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncerConfig {
    /// Sleep between iterations when nothing went wrong.
    pub poll_interval_ms: u64,
    /// Maximum orders fetched per iteration.
    pub batch_size: usize,
    /// Upper bound on the backed-off poll interval.
    pub max_backoff_ms: u64,
    /// Jitter factor applied to backed-off delays, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            batch_size: 10,
            max_backoff_ms: 60_000,
            jitter: 0.1,
        }
    }
}

impl SyncerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
