//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! `PollBackoff` stretches the sync loop's poll interval after failed
//! iterations. `connection_backoff` drives startup connection retries via
//! `backon`.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff applied to the poll interval after consecutive failed iterations.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    /// Delay with no failures (the poll interval).
    pub base_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// Jitter factor: delay is multiplied by random value in [1-jitter, 1+jitter].
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl PollBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after `failures` consecutive failed iterations.
    ///
    /// Uses exponential backoff: delay = base * 2^failures, capped at max_delay.
    /// Jitter is applied using a simple hash-based approach to avoid thundering herd.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << failures.min(20));
        let capped_ms = exponential_ms.min(max_ms);

        // Uses current time nanos + failures as entropy source
        let jittered_ms = if self.jitter > 0.0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = now.wrapping_mul(31).wrapping_add(failures as u64 * 17);
            let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0; // -1.0 to 1.0
            let jitter_factor = 1.0 + (jitter_pct * self.jitter);
            ((capped_ms as f64 * jitter_factor) as u64).min(max_ms)
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }
}

/// Backoff for database connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
