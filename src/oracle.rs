//! Accrual oracle client.
//!
//! The oracle is an external service that decides, per order, whether a reward
//! is due and how large it is. It is queried with
//! `GET {base}/api/orders/{number}` and may throttle or fail at any time;
//! every non-200 answer is treated as "ask again next round".

use crate::error::Result;
use crate::order::OrderNumber;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// What the oracle decided about an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Registered or still being calculated, or the oracle could not answer.
    InProgress,

    /// Reward calculated.
    Completed,

    /// The oracle refused to calculate a reward.
    Failed,

    /// Unrecognized status token.
    Undefined,
}

impl Outcome {
    /// Maps an oracle status token to an outcome. Total: anything unknown is
    /// `Undefined`.
    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTERED" | "PROCESSING" => Outcome::InProgress,
            "INVALID" => Outcome::Failed,
            "PROCESSED" => Outcome::Completed,
            _ => Outcome::Undefined,
        }
    }
}

/// A classified oracle answer.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub outcome: Outcome,

    /// Reward in decimal form, zero unless the outcome is `Completed`.
    pub accrual: Decimal,

    /// Raw status token, kept for logging undefined answers.
    pub status: String,
}

impl OracleReply {
    fn retry_later() -> Self {
        OracleReply {
            outcome: Outcome::InProgress,
            accrual: Decimal::ZERO,
            status: String::new(),
        }
    }
}

/// Resolves orders against the accrual authority.
#[async_trait]
pub trait AccrualOracle: Send + Sync {
    /// Asks the oracle about one order. Transport failures are errors; the
    /// caller skips that order for the current round.
    async fn resolve(&self, number: OrderNumber) -> Result<OracleReply>;
}

/// Body of a 200 answer.
#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    accrual: Option<f64>,
}

/// HTTP client for the accrual oracle.
pub struct HttpAccrualOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualOracle {
    /// Builds a client whose every request is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        HttpAccrualOracle { client, base_url }
    }

    fn order_url(&self, number: OrderNumber) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }
}

#[async_trait]
impl AccrualOracle for HttpAccrualOracle {
    async fn resolve(&self, number: OrderNumber) -> Result<OracleReply> {
        let response = self.client.get(self.order_url(number)).send().await?;
        let status = response.status();

        if status != StatusCode::OK {
            debug!("Oracle answered {} for order {}, retrying later", status, number);
            return Ok(OracleReply::retry_later());
        }

        let body = response.bytes().await?;
        let parsed: OrderResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Oracle sent an unreadable body for order {}: {}", number, e);
                return Ok(OracleReply {
                    outcome: Outcome::Undefined,
                    accrual: Decimal::ZERO,
                    status: String::new(),
                });
            }
        };

        let outcome = Outcome::from_token(&parsed.status);
        let accrual = match (outcome, parsed.accrual) {
            (Outcome::Completed, Some(value)) => match accrual_to_decimal(value) {
                Some(accrual) => accrual,
                None => {
                    warn!(
                        "Oracle accrual {} for order {} is not representable",
                        value, number
                    );
                    return Ok(OracleReply {
                        outcome: Outcome::Undefined,
                        accrual: Decimal::ZERO,
                        status: parsed.status,
                    });
                }
            },
            _ => Decimal::ZERO,
        };

        Ok(OracleReply {
            outcome,
            accrual,
            status: parsed.status,
        })
    }
}

/// Renders a JSON float through its shortest round-trip form so that
/// `123.45` stays `123.45`. `None` if the value does not fit a `Decimal`.
fn accrual_to_decimal(value: f64) -> Option<Decimal> {
    value.to_string().parse::<Decimal>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_token_mapping() {
        assert_eq!(Outcome::from_token("REGISTERED"), Outcome::InProgress);
        assert_eq!(Outcome::from_token("PROCESSING"), Outcome::InProgress);
        assert_eq!(Outcome::from_token("INVALID"), Outcome::Failed);
        assert_eq!(Outcome::from_token("PROCESSED"), Outcome::Completed);
    }

    #[test]
    fn test_unknown_tokens_are_undefined() {
        for token in ["", "processed", "DONE", "NEW"] {
            assert_eq!(Outcome::from_token(token), Outcome::Undefined);
        }
    }

    #[test]
    fn test_accrual_keeps_decimal_digits() {
        assert_eq!(accrual_to_decimal(500.0), Some(Decimal::from(500)));
        assert_eq!(
            accrual_to_decimal(729.98),
            Some(Decimal::from_str("729.98").unwrap())
        );
    }

    #[test]
    fn test_unrepresentable_accrual_is_rejected() {
        assert_eq!(accrual_to_decimal(1e30), None);
        assert_eq!(accrual_to_decimal(f64::INFINITY), None);
    }

    #[test]
    fn test_order_url_trims_trailing_slash() {
        let oracle = HttpAccrualOracle::with_client(reqwest::Client::new(), "http://oracle:8080/");
        let number = OrderNumber::new(79927398713).unwrap();
        assert_eq!(
            oracle.order_url(number),
            "http://oracle:8080/api/orders/79927398713"
        );
    }
}
