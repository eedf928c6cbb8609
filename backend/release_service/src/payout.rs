//! HTTP payout provider client.
//!
//! ## Classification
//!
//! * `2xx` with a `transaction_id` is a success.
//! * `408`, `429` and `5xx` are transient and retried by the disbursement
//!   engine with back-off.
//! * Every other `4xx` is a hard refusal; the milestone goes to
//!   `release_failed`.
//! * Transport errors (connection reset, DNS, timeout) surface as
//!   `ExternalService` errors, which the engine also retries.

use async_trait::async_trait;
use escrow_protocol::disbursement::{PayoutOutcome, PayoutProvider, PayoutRequest};
use escrow_protocol::EscrowError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct PayoutAccepted {
    pub transaction_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PayoutRefused {
    #[serde(alias = "message")]
    pub error: String,
}

pub struct HttpPayoutProvider {
    client: Client,
    url: String,
}

impl HttpPayoutProvider {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

/// Map a provider response onto a payout outcome.
pub fn classify(status: StatusCode, body: &str) -> PayoutOutcome {
    if status.is_success() {
        return match serde_json::from_str::<PayoutAccepted>(body) {
            Ok(accepted) => PayoutOutcome::Success {
                transaction_id: accepted.transaction_id,
            },
            Err(e) => PayoutOutcome::Failure {
                reason: format!("unreadable payout confirmation: {e}"),
                retryable: true,
            },
        };
    }
    let reason = serde_json::from_str::<PayoutRefused>(body)
        .map(|r| r.error)
        .unwrap_or_else(|_| body.trim().chars().take(200).collect());
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    PayoutOutcome::Failure {
        reason: format!("provider returned {status}: {reason}"),
        retryable,
    }
}

#[async_trait]
impl PayoutProvider for HttpPayoutProvider {
    async fn payout(&self, request: &PayoutRequest) -> escrow_protocol::Result<PayoutOutcome> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| EscrowError::ExternalService(format!("payout request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EscrowError::ExternalService(format!("payout response unreadable: {e}")))?;

        let outcome = classify(status, &body);
        match &outcome {
            PayoutOutcome::Success { transaction_id } => {
                debug!("payout {} accepted as {transaction_id}", request.idempotency_key)
            }
            PayoutOutcome::Failure { reason, retryable } => {
                warn!(
                    "payout {} refused (retryable={retryable}): {reason}",
                    request.idempotency_key
                )
            }
        }
        Ok(outcome)
    }
}
