//! Accrual synchronization service.
//!
//! Polls the ledger for orders that are not yet terminal, asks the accrual
//! authority about each one and writes the outcome back. Runs as a single
//! background task; all progress lives in the ledger, so a restarted service
//! simply picks up where the previous one left off.
//!
//! ## Pacing
//!
//! - A rate-limit answer pauses the whole loop until the authority's
//!   `Retry-After` elapses. The rest of the batch is abandoned.
//! - Transient client errors and storage failures stretch the poll interval
//!   exponentially, capped at `max_backoff`. A clean iteration resets it.
//!
//! ## Shutdown
//!
//! Stop is cooperative: the loop checks between orders and wakes from any
//! sleep, but never abandons an in-flight ledger write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::accrual::{AccrualClient, AccrualError, AccrualOutcome};
use crate::config::SyncerConfig;
use crate::model::Order;
use crate::storage::{ApplyResult, LedgerStore, StorageError};
use crate::utils::retry::PollBackoff;

/// Longest rate-limit pause the loop will honour.
pub const MAX_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

/// Sync loop configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sleep between iterations when nothing is failing.
    pub poll_interval: Duration,
    /// Maximum orders fetched per iteration.
    pub batch_size: usize,
    /// Upper bound for the backed-off poll interval.
    pub max_backoff: Duration,
    /// Jitter factor applied to backed-off delays.
    pub jitter: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from(&SyncerConfig::default())
    }
}

impl From<&SyncerConfig> for SyncConfig {
    fn from(config: &SyncerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
            max_backoff: config.max_backoff(),
            jitter: config.jitter,
        }
    }
}

/// Lifecycle state of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Running,
    /// Rate limited; no queries are issued before `until`.
    Paused { until: Instant },
    Stopping,
    Stopped,
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Orders the authority was asked about.
    pub queried: usize,
    pub committed: usize,
    pub already_applied: usize,
    pub not_registered: usize,
    /// Network, server or decode failures from the authority.
    pub transient_failures: usize,
    /// Ledger rejected the outcome for one order.
    pub order_failures: usize,
    /// The ledger itself failed; the iteration ended early.
    pub storage_failed: bool,
    /// Pause requested by the authority, if any.
    pub rate_limited: Option<Duration>,
}

impl SyncReport {
    /// Iterations that should back the poll interval off.
    pub fn is_failure(&self) -> bool {
        self.storage_failed || self.transient_failures > 0
    }
}

/// Reconciles pending orders with the accrual authority.
pub struct SyncService {
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn AccrualClient>,
    config: SyncConfig,
    backoff: PollBackoff,
    consecutive_failures: u32,
    /// Shared rate-limit deadline. No query may be issued before it.
    pause_until: Option<Instant>,
    state: watch::Sender<SyncState>,
    stop_rx: Option<watch::Receiver<bool>>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        client: Arc<dyn AccrualClient>,
        config: SyncConfig,
    ) -> Self {
        let backoff = PollBackoff::new(config.poll_interval, config.max_backoff)
            .with_jitter(config.jitter);
        let (state, _) = watch::channel(SyncState::Running);

        Self {
            store,
            client,
            config,
            backoff,
            consecutive_failures: 0,
            pause_until: None,
            state,
            stop_rx: None,
        }
    }

    /// Spawn the sync loop onto the tokio runtime.
    pub fn start(mut self) -> SyncHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_rx = Some(stop_rx.clone());
        let state_rx = self.state.subscribe();
        let task = tokio::spawn(self.run(stop_rx));

        SyncHandle {
            stop_tx,
            state_rx,
            task,
        }
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            max_backoff = ?self.config.max_backoff,
            "Starting accrual sync loop"
        );

        loop {
            if self.stop_requested() {
                break;
            }

            if let Some(until) = self.pause_until {
                self.set_state(SyncState::Paused { until });
                if !sleep_until_or_stop(until, &mut stop_rx).await {
                    break;
                }
                self.pause_until = None;
                self.set_state(SyncState::Running);
                info!("Rate limit pause elapsed, resuming");
            }

            let report = self.sync_batch().await;
            if report.queried > 0 || report.storage_failed {
                debug!(?report, "Sync iteration finished");
            }

            let delay = self.next_delay(&report);

            // A fresh pause replaces the poll sleep.
            if self.pause_until.is_some() {
                continue;
            }

            if !sleep_until_or_stop(Instant::now() + delay, &mut stop_rx).await {
                break;
            }
        }

        self.set_state(SyncState::Stopping);
        info!("Accrual sync loop stopping");
        self.set_state(SyncState::Stopped);
    }

    /// Run one iteration: fetch a batch and reconcile each order in it.
    pub async fn sync_batch(&mut self) -> SyncReport {
        let mut report = SyncReport::default();

        let orders = match self.store.fetch_pending(self.config.batch_size).await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "Failed to fetch pending orders, ledger unavailable");
                report.storage_failed = true;
                return report;
            }
        };

        for order in orders {
            if self.stop_requested() {
                debug!("Stop requested, leaving remainder of batch");
                break;
            }

            report.queried += 1;
            match self.client.query(&order.number).await {
                Ok(outcome) => match self.apply(&order, outcome).await {
                    Ok(ApplyResult::Committed) => report.committed += 1,
                    Ok(ApplyResult::AlreadyApplied) => report.already_applied += 1,
                    Err(e) if e.is_order_specific() => {
                        warn!(order = %order.number, error = %e, "Ledger rejected accrual outcome");
                        report.order_failures += 1;
                    }
                    Err(e) => {
                        error!(order = %order.number, error = %e, "Failed to apply accrual outcome, ledger unavailable");
                        report.storage_failed = true;
                        break;
                    }
                },
                Err(AccrualError::RateLimited { retry_after }) => {
                    let retry_after = self.pause(retry_after);
                    report.rate_limited = Some(retry_after);
                    info!(
                        order = %order.number,
                        retry_after = ?retry_after,
                        "Rate limited by accrual authority, pausing"
                    );
                    break;
                }
                Err(AccrualError::NotRegistered(_)) => {
                    debug!(order = %order.number, "Order not yet registered with accrual authority");
                    report.not_registered += 1;
                }
                Err(e) => {
                    debug!(order = %order.number, error = %e, "Accrual query failed, will retry");
                    report.transient_failures += 1;
                }
            }
        }

        report
    }

    /// Write the authority's answer to the ledger.
    ///
    /// An order already at the reported status needs no write.
    async fn apply(
        &self,
        order: &Order,
        outcome: AccrualOutcome,
    ) -> Result<ApplyResult, StorageError> {
        let status = outcome.status.order_status();
        if status == order.status {
            return Ok(ApplyResult::AlreadyApplied);
        }

        let result = self
            .store
            .apply_outcome(&order.number, status, outcome.accrual)
            .await?;

        if result == ApplyResult::Committed {
            info!(
                order = %order.number,
                status = %status,
                accrual = ?outcome.accrual,
                "Order status updated"
            );
        }
        Ok(result)
    }

    /// Extend the shared pause. Returns the pause actually applied.
    fn pause(&mut self, retry_after: Duration) -> Duration {
        let retry_after = retry_after.min(MAX_PAUSE);
        let now = Instant::now();
        let until = now
            .checked_add(retry_after)
            .or_else(|| now.checked_add(MAX_PAUSE))
            .unwrap_or(now);
        self.pause_until = Some(self.pause_until.map_or(until, |current| current.max(until)));
        retry_after
    }

    /// Poll delay after an iteration, backing off on consecutive failures.
    pub fn next_delay(&mut self, report: &SyncReport) -> Duration {
        if report.is_failure() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            let delay = self.backoff.delay_for_failures(self.consecutive_failures);
            warn!(
                failures = self.consecutive_failures,
                delay = ?delay,
                "Sync iteration failed, backing off"
            );
            delay
        } else {
            self.consecutive_failures = 0;
            self.config.poll_interval
        }
    }

    /// Pending rate-limit deadline, if any.
    pub fn paused_until(&self) -> Option<Instant> {
        self.pause_until
    }

    fn stop_requested(&self) -> bool {
        self.stop_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }
}

/// Sleep until `deadline`. Returns false if stop was requested first or the
/// handle was dropped.
async fn sleep_until_or_stop(deadline: Instant, stop_rx: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return false;
                }
            }
        }
    }
}

/// Handle to a running sync loop.
///
/// Dropping the handle without calling [`SyncHandle::stop`] also stops the
/// loop, but does not wait for it.
pub struct SyncHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SyncState>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// Signal shutdown and wait for the loop to reach `Stopped`.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Accrual sync task failed");
        }
    }
}
