//! Upstream proxy: forwards a validated JSON-RPC envelope to the selected
//! provider and walks the remaining providers on failure.
//!
//! The envelope and the upstream's response body pass through verbatim. When
//! every provider fails the caller receives a JSON-RPC error envelope with
//! code `-32603`, over HTTP 200: by the time the proxy runs the payment has
//! already been spent.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::providers::{ProviderRegistry, SelectionStrategy};
use crate::types::{JSONRPC_INTERNAL_ERROR, RpcEnvelope, error_envelope};

/// Timeout applied to each provider attempt.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UpstreamProxy {
    registry: Arc<ProviderRegistry>,
    strategy: SelectionStrategy,
    http: reqwest::Client,
}

impl UpstreamProxy {
    pub fn new(registry: Arc<ProviderRegistry>, strategy: SelectionStrategy) -> Self {
        UpstreamProxy {
            registry,
            strategy,
            http: reqwest::Client::new(),
        }
    }

    /// Forwards the envelope: primary provider first (registry selection with
    /// the configured scoring formula), then every other provider in
    /// registration order. Each attempt updates provider health.
    pub async fn forward(&self, envelope: &RpcEnvelope) -> Value {
        let Some(primary) = self.registry.select(&envelope.method, self.strategy) else {
            tracing::error!("no upstream providers registered");
            return unavailable(&envelope.id);
        };

        match self.attempt(&primary.id, &primary.url, envelope).await {
            Some(body) => return body,
            None => {
                tracing::warn!(provider = %primary.id, method = %envelope.method, "primary upstream failed, trying fallbacks");
            }
        }

        for record in self.registry.providers_in_order() {
            if record.id == primary.id {
                continue;
            }
            if let Some(body) = self.attempt(&record.id, &record.url, envelope).await {
                return body;
            }
        }

        tracing::error!(method = %envelope.method, "all upstream providers failed");
        unavailable(&envelope.id)
    }

    async fn attempt(&self, id: &str, url: &str, envelope: &RpcEnvelope) -> Option<Value> {
        let result = self
            .http
            .post(url)
            .timeout(UPSTREAM_TIMEOUT)
            .json(envelope)
            .send()
            .await;
        let body = match result {
            Ok(response) if response.status().is_success() => {
                response.json::<Value>().await.ok()
            }
            Ok(response) => {
                tracing::debug!(provider = id, status = %response.status(), "upstream returned an error status");
                None
            }
            Err(e) => {
                tracing::debug!(provider = id, error = %e, "upstream unreachable");
                None
            }
        };
        match body {
            Some(body) => {
                self.registry.record_success(id);
                Some(body)
            }
            None => {
                self.registry.record_failure(id);
                None
            }
        }
    }
}

fn unavailable(id: &Value) -> Value {
    error_envelope(
        id,
        JSONRPC_INTERNAL_ERROR,
        "All upstream providers are unavailable",
    )
}
