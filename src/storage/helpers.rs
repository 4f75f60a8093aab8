//! Rules shared by every ledger backend.

#[cfg(feature = "sqlite")]
use std::str::FromStr;

#[cfg(feature = "sqlite")]
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{Result, StorageError};
use crate::model::{OrderNumber, OrderStatus};

/// What `apply_outcome` should do once it has read the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyPlan {
    Write,
    Skip,
}

/// Check an accrual amount against the requested status.
///
/// `PROCESSED` requires a non-negative amount; other statuses carry none.
pub(crate) fn validate_accrual(
    number: &OrderNumber,
    status: OrderStatus,
    accrual: Option<Decimal>,
) -> Result<Option<Decimal>> {
    if status != OrderStatus::Processed {
        return Ok(None);
    }

    match accrual {
        None => Err(StorageError::InvalidAccrual {
            order: number.clone(),
            reason: "missing amount".to_string(),
        }),
        Some(amount) if amount < Decimal::ZERO => Err(StorageError::InvalidAccrual {
            order: number.clone(),
            reason: format!("negative amount {amount}"),
        }),
        Some(amount) => Ok(Some(amount)),
    }
}

/// Decide whether a status change is a forward transition.
///
/// Backward moves and moves out of a terminal status are skipped and logged
/// for audit rather than surfaced as errors.
pub(crate) fn plan_apply(
    number: &OrderNumber,
    current: OrderStatus,
    requested: OrderStatus,
) -> ApplyPlan {
    if current == requested {
        debug!(order = %number, status = %current, "Order already in requested status");
        return ApplyPlan::Skip;
    }

    if current.can_transition_to(requested) {
        return ApplyPlan::Write;
    }

    warn!(
        order = %number,
        current = %current,
        requested = %requested,
        "Ignoring non-monotonic order status transition"
    );
    ApplyPlan::Skip
}

/// Withdrawal sums must be strictly positive.
pub(crate) fn validate_withdrawal(sum: Decimal) -> Result<()> {
    if sum <= Decimal::ZERO {
        return Err(StorageError::InvalidAmount(sum));
    }
    Ok(())
}

/// Fixed-width RFC 3339 so that text timestamps sort chronologically.
#[cfg(feature = "sqlite")]
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(feature = "sqlite")]
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

#[cfg(feature = "sqlite")]
pub(crate) fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| StorageError::Corrupt(format!("amount {raw:?}: {e}")))
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn parse_status(raw: &str) -> Result<OrderStatus> {
    raw.parse().map_err(StorageError::Corrupt)
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn parse_number(raw: &str) -> Result<OrderNumber> {
    OrderNumber::parse(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}
