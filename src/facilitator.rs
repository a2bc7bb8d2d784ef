//! Client for the optional external facilitator.
//!
//! The facilitator is never load-bearing. A passing verify response lets the
//! pipeline skip the on-chain lookup; any other verify outcome (an explicit
//! rejection, an unexpected shape, a transport failure) falls through to
//! on-chain verification. Settlement notification reduces every outcome to a
//! single `settled` boolean that is reported to the caller and influences
//! nothing else.

use serde_json::{Value, json};
use std::time::Duration;
use uuid::Uuid;

use crate::config::CHAIN_TAG;

/// Timeout for facilitator verify and settle calls.
const FACILITATOR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FacilitatorClient {
    verify_url: Option<String>,
    settle_url: Option<String>,
    http: reqwest::Client,
}

impl FacilitatorClient {
    pub fn new(verify_url: Option<String>, settle_url: Option<String>) -> Self {
        FacilitatorClient {
            verify_url,
            settle_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn has_verifier(&self) -> bool {
        self.verify_url.is_some()
    }

    /// Asks the facilitator to vouch for a payment. Returns `true` only on an
    /// explicit pass; everything else means "decide on-chain".
    ///
    /// The response schema is unpinned, so this scans for any of the field
    /// shapes known facilitators use: `verified: true`, `valid: true`, or
    /// `status: "success"`.
    pub async fn passes_verification(&self, tx_signature: &str, payment_id: Uuid) -> bool {
        let Some(url) = &self.verify_url else {
            return false;
        };
        let body = json!({
            "txSignature": tx_signature,
            "paymentId": payment_id,
            "chain": CHAIN_TAG,
        });
        let response = self
            .http
            .post(url)
            .timeout(FACILITATOR_TIMEOUT)
            .json(&body)
            .send()
            .await;
        let reply: Value = match response {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(error = %e, "facilitator verify reply not parseable");
                    return false;
                }
            },
            Ok(response) => {
                tracing::warn!(status = %response.status(), "facilitator verify rejected");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "facilitator verify unreachable");
                return false;
            }
        };
        let passed = reply["verified"].as_bool() == Some(true)
            || reply["valid"].as_bool() == Some(true)
            || reply["status"].as_str() == Some("success");
        if passed {
            tracing::debug!(%payment_id, "facilitator vouched for payment");
        }
        passed
    }

    /// Best-effort settlement notification. With no settle endpoint
    /// configured there is nothing to notify and settlement counts as done.
    pub async fn notify_settlement(&self, tx_signature: &str, payment_id: Uuid) -> bool {
        let Some(url) = &self.settle_url else {
            return true;
        };
        let body = json!({
            "txSignature": tx_signature,
            "paymentId": payment_id,
            "chain": CHAIN_TAG,
        });
        match self
            .http
            .post(url)
            .timeout(FACILITATOR_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), %payment_id, "settlement notification rejected");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, %payment_id, "settlement notification failed");
                false
            }
        }
    }
}
