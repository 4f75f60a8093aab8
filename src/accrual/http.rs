//! HTTP accrual authority client.
//!
//! `GET {base_url}/orders/{number}`:
//! - `200` JSON `{order, status, accrual}`
//! - `204` / `404` order not registered yet
//! - `429` with `Retry-After`
//! - `5xx` transient

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AccrualClient, AccrualError, AccrualOutcome, AccrualStatus, Result};
use crate::model::OrderNumber;

/// Pause applied when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest pause honoured from a `Retry-After`; larger values are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpAccrualConfig {
    /// Authority base URL, e.g. `http://localhost:8081/api`.
    pub base_url: String,

    /// Request timeout.
    pub timeout: Duration,
}

impl Default for HttpAccrualConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HttpAccrualConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Wire format of a `200` response.
#[derive(Debug, Deserialize)]
struct AccrualResponse {
    order: String,
    status: AccrualStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    accrual: Option<Decimal>,
}

/// reqwest-backed accrual client.
pub struct HttpAccrualClient {
    client: Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// Create a new client. Fails if the base URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: HttpAccrualConfig) -> std::result::Result<Self, AccrualError> {
        if config.base_url.trim().is_empty() {
            return Err(AccrualError::Transient(
                "accrual base URL not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AccrualError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, order: &OrderNumber) -> String {
        format!("{}/orders/{}", self.base_url, order)
    }

    fn decode(order: &OrderNumber, body: &[u8]) -> Result<AccrualOutcome> {
        let response: AccrualResponse =
            serde_json::from_slice(body).map_err(|e| AccrualError::Decode(e.to_string()))?;

        if response.order != order.as_str() {
            return Err(AccrualError::Decode(format!(
                "response for order {} while querying {}",
                response.order, order
            )));
        }

        let accrual = match response.status {
            AccrualStatus::Processed => {
                let amount = response.accrual.unwrap_or(Decimal::ZERO);
                if amount.is_sign_negative() && !amount.is_zero() {
                    return Err(AccrualError::Decode(format!(
                        "negative accrual {amount} for order {order}"
                    )));
                }
                Some(amount)
            }
            _ => None,
        };

        Ok(AccrualOutcome {
            order: order.clone(),
            status: response.status,
            accrual,
        })
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP date.
///
/// The result never exceeds [`MAX_RETRY_AFTER`].
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let delay = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?;
            let delta = at.with_timezone(&Utc) - now;
            delta.to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn query(&self, order: &OrderNumber) -> Result<AccrualOutcome> {
        let url = self.order_url(order);

        let response = self.client.get(&url).send().await.map_err(|e| {
            debug!(order = %order, error = %e, "Accrual request failed");
            AccrualError::Transient(e.to_string())
        })?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| AccrualError::Transient(e.to_string()))?;
                Self::decode(order, &body)
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                Err(AccrualError::NotRegistered(order.clone()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| parse_retry_after(v, Utc::now()))
                    .unwrap_or(DEFAULT_RETRY_AFTER);

                warn!(
                    order = %order,
                    retry_after = ?retry_after,
                    "Accrual authority rate limit reached"
                );
                Err(AccrualError::RateLimited { retry_after })
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                Err(AccrualError::Transient(format!(
                    "HTTP {} - {}",
                    other,
                    body.chars().take(200).collect::<String>()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn number() -> OrderNumber {
        OrderNumber::parse("9278923470").unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = HttpAccrualConfig::default();
        assert!(config.base_url.is_empty());
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_base_url_fails() {
        assert!(HttpAccrualClient::new(HttpAccrualConfig::default()).is_err());
    }

    #[test]
    fn test_order_url_strips_trailing_slash() {
        let client = HttpAccrualClient::new(
            HttpAccrualConfig::default().with_base_url("http://accrual:8081/api/"),
        )
        .unwrap();
        assert_eq!(
            client.order_url(&number()),
            "http://accrual:8081/api/orders/9278923470"
        );
    }

    #[test]
    fn test_decode_processed() {
        let body = br#"{"order":"9278923470","status":"PROCESSED","accrual":500}"#;
        let outcome = HttpAccrualClient::decode(&number(), body).unwrap();
        assert_eq!(outcome.status, AccrualStatus::Processed);
        assert_eq!(outcome.accrual, Some(Decimal::new(500, 0)));
    }

    #[test]
    fn test_decode_fractional_accrual() {
        let body = br#"{"order":"9278923470","status":"PROCESSED","accrual":729.98}"#;
        let outcome = HttpAccrualClient::decode(&number(), body).unwrap();
        assert_eq!(outcome.accrual, Some(Decimal::new(72998, 2)));
    }

    #[test]
    fn test_decode_processed_without_accrual_is_zero() {
        let body = br#"{"order":"9278923470","status":"PROCESSED"}"#;
        let outcome = HttpAccrualClient::decode(&number(), body).unwrap();
        assert_eq!(outcome.accrual, Some(Decimal::ZERO));
    }

    #[test]
    fn test_decode_registered_drops_accrual() {
        let body = br#"{"order":"9278923470","status":"REGISTERED"}"#;
        let outcome = HttpAccrualClient::decode(&number(), body).unwrap();
        assert_eq!(outcome.status, AccrualStatus::Registered);
        assert_eq!(outcome.accrual, None);
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let body = br#"{"order":"9278923470","status":"DONE"}"#;
        let err = HttpAccrualClient::decode(&number(), body).unwrap_err();
        assert!(matches!(err, AccrualError::Decode(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_rejects_mismatched_order() {
        let body = br#"{"order":"12345678903","status":"PROCESSING"}"#;
        assert!(matches!(
            HttpAccrualClient::decode(&number(), body),
            Err(AccrualError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_negative_accrual() {
        let body = br#"{"order":"9278923470","status":"PROCESSED","accrual":-5}"#;
        assert!(matches!(
            HttpAccrualClient::decode(&number(), body),
            Err(AccrualError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("60", Utc::now()),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after(" 5 ", Utc::now()),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 30, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_clamps_oversized_values() {
        assert_eq!(
            parse_retry_after("18446744073709551615", Utc::now()),
            Some(MAX_RETRY_AFTER)
        );

        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Fri, 31 Dec 9999 23:59:59 GMT", now),
            Some(MAX_RETRY_AFTER)
        );
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }
}
