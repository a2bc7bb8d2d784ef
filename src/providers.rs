//! Upstream provider registry: an ordered set of JSON-RPC endpoints with
//! health tracking, scoring, and selection.
//!
//! Reads dominate writes by far: selection snapshots the registry under a
//! read lock, while health updates and runtime additions take the write lock,
//! so in-flight selections never observe a partial record.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::timestamp::UnixTimestamp;

/// A provider stays selectable up to this many consecutive failures.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Timeout for the `getHealth` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the background loop probes every provider.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    Premium,
    Public,
    Community,
}

/// Static description of one upstream endpoint. Reputation and uptime are
/// operator-stated scores on a 0–100 scale; latency is the stated typical
/// response time in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub tier: ProviderTier,
    pub price_multiplier: f64,
    pub reputation: f64,
    pub uptime: f64,
    pub latency_ms: f64,
    pub features: Vec<String>,
}

impl ProviderRecord {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_check: Option<UnixTimestamp>,
    pub consecutive_failures: u32,
}

impl ProviderHealth {
    fn new() -> Self {
        ProviderHealth {
            status: HealthStatus::Unknown,
            last_check: None,
            consecutive_failures: 0,
        }
    }

    fn selectable(&self) -> bool {
        self.consecutive_failures <= MAX_CONSECUTIVE_FAILURES
    }
}

/// Scoring formula used for a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Balanced,
    Cheapest,
}

/// Methods that can only be answered by archives holding deep history.
pub fn requires_historical(method: &str) -> bool {
    matches!(
        method,
        "getBlock" | "getTransaction" | "getSignaturesForAddress"
    )
}

fn score(record: &ProviderRecord, strategy: SelectionStrategy) -> f64 {
    match strategy {
        SelectionStrategy::Balanced => {
            record.reputation * 0.4
                + record.uptime * 0.3
                + (1.0 - record.price_multiplier) * 0.2
                + (1.0 - record.latency_ms / 500.0) * 0.1
        }
        SelectionStrategy::Cheapest => {
            (1.0 - record.price_multiplier) * 0.5 + record.reputation * 0.3 + record.uptime * 0.2
        }
    }
}

struct RegistryState {
    /// Append-only; insertion order breaks scoring ties.
    providers: Vec<ProviderRecord>,
    health: HashMap<String, ProviderHealth>,
}

pub struct ProviderRegistry {
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            state: RwLock::new(RegistryState {
                providers: Vec::new(),
                health: HashMap::new(),
            }),
        }
    }

    /// Adds a provider at runtime. It enters the pool immediately with
    /// `unknown` status.
    pub fn add(&self, record: ProviderRecord) {
        let mut state = self.state.write();
        state.health.insert(record.id.clone(), ProviderHealth::new());
        tracing::info!(id = %record.id, url = %record.url, "registered upstream provider");
        state.providers.push(record);
    }

    /// Picks the best provider for a method. Candidates are the selectable
    /// providers (and, for historical methods, those holding deep history);
    /// when none qualify the health filter is relaxed and selection runs
    /// degraded over the full pool.
    pub fn select(&self, method: &str, strategy: SelectionStrategy) -> Option<ProviderRecord> {
        let need_historical = requires_historical(method);
        let state = self.state.read();
        let candidates: Vec<&ProviderRecord> = state
            .providers
            .iter()
            .filter(|record| {
                let healthy = state
                    .health
                    .get(&record.id)
                    .map(ProviderHealth::selectable)
                    .unwrap_or(true);
                healthy && (!need_historical || record.has_feature("historical"))
            })
            .collect();
        let candidates = if candidates.is_empty() {
            tracing::warn!(method, "no healthy providers, selecting degraded");
            state.providers.iter().collect()
        } else {
            candidates
        };

        let mut best: Option<(&ProviderRecord, f64)> = None;
        for record in candidates {
            let record_score = score(record, strategy);
            // Strict comparison keeps the earliest-registered on ties.
            if best.map(|(_, s)| record_score > s).unwrap_or(true) {
                best = Some((record, record_score));
            }
        }
        best.map(|(record, _)| record.clone())
    }

    /// Snapshot of all providers in registration order, for the failover walk.
    pub fn providers_in_order(&self) -> Vec<ProviderRecord> {
        self.state.read().providers.clone()
    }

    pub fn record_success(&self, id: &str) {
        let mut state = self.state.write();
        if let Some(health) = state.health.get_mut(id) {
            health.status = HealthStatus::Healthy;
            health.consecutive_failures = 0;
            health.last_check = Some(UnixTimestamp::now());
        }
    }

    pub fn record_failure(&self, id: &str) {
        let mut state = self.state.write();
        if let Some(health) = state.health.get_mut(id) {
            health.status = HealthStatus::Unhealthy;
            health.consecutive_failures += 1;
            health.last_check = Some(UnixTimestamp::now());
            if health.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                tracing::warn!(
                    id,
                    failures = health.consecutive_failures,
                    "provider excluded from selection"
                );
            }
        }
    }

    pub fn health_of(&self, id: &str) -> Option<ProviderHealth> {
        self.state.read().health.get(id).cloned()
    }

    /// Health snapshot in registration order, for the health surface.
    pub fn health_snapshot(&self) -> Vec<(String, ProviderHealth)> {
        let state = self.state.read();
        state
            .providers
            .iter()
            .map(|record| {
                let health = state
                    .health
                    .get(&record.id)
                    .cloned()
                    .unwrap_or_else(ProviderHealth::new);
                (record.id.clone(), health)
            })
            .collect()
    }

    /// Probes every provider with a trivial `getHealth` call and records the
    /// outcome.
    pub async fn probe(&self, http: &reqwest::Client) {
        let providers = self.providers_in_order();
        for record in providers {
            let healthy = probe_endpoint(http, &record.url).await;
            if healthy {
                self.record_success(&record.id);
            } else {
                self.record_failure(&record.id);
            }
        }
    }

    /// Probes all providers every minute until cancelled.
    pub fn spawn_probe_loop(
        self: std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let http = reqwest::Client::new();
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => registry.probe(&http).await,
                }
            }
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_endpoint(http: &reqwest::Client, url: &str) -> bool {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "getHealth" });
    match http
        .post(url)
        .timeout(PROBE_TIMEOUT)
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, reputation: f64, multiplier: f64, features: &[&str]) -> ProviderRecord {
        ProviderRecord {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("http://{id}.invalid"),
            tier: ProviderTier::Premium,
            price_multiplier: multiplier,
            reputation,
            uptime: 99.0,
            latency_ms: 200.0,
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn selects_the_highest_balanced_score() {
        let registry = ProviderRegistry::new();
        registry.add(record("low", 50.0, 1.0, &["historical"]));
        registry.add(record("high", 95.0, 1.0, &["historical"]));

        let chosen = registry
            .select("getBlock", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "high");
    }

    #[test]
    fn cheapest_strategy_prefers_the_lower_multiplier() {
        let registry = ProviderRegistry::new();
        registry.add(record("pricy", 90.0, 1.0, &[]));
        registry.add(record("cheap", 89.0, 0.2, &[]));

        // The balanced formula keeps the stronger reputation on top.
        let chosen = registry
            .select("getSlot", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "pricy");

        // The cheapest formula flips the choice to the lower multiplier.
        let chosen = registry
            .select("getSlot", SelectionStrategy::Cheapest)
            .unwrap();
        assert_eq!(chosen.id, "cheap");
    }

    #[test]
    fn ties_break_by_registration_order() {
        let registry = ProviderRegistry::new();
        registry.add(record("first", 90.0, 1.0, &[]));
        registry.add(record("second", 90.0, 1.0, &[]));

        let chosen = registry
            .select("getSlot", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "first");
    }

    #[test]
    fn historical_methods_filter_on_the_feature() {
        let registry = ProviderRegistry::new();
        registry.add(record("fast", 99.0, 1.0, &[]));
        registry.add(record("archive", 70.0, 1.0, &["historical"]));

        let chosen = registry
            .select("getBlock", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "archive");

        // Non-historical methods may still use the stronger provider.
        let chosen = registry
            .select("getSlot", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "fast");
    }

    #[test]
    fn three_failures_keep_a_provider_selectable_four_do_not() {
        let registry = ProviderRegistry::new();
        registry.add(record("flaky", 99.0, 1.0, &[]));
        registry.add(record("steady", 50.0, 1.0, &[]));

        for _ in 0..3 {
            registry.record_failure("flaky");
        }
        let chosen = registry
            .select("getSlot", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "flaky");

        registry.record_failure("flaky");
        let chosen = registry
            .select("getSlot", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "steady");
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let registry = ProviderRegistry::new();
        registry.add(record("flaky", 99.0, 1.0, &[]));
        for _ in 0..4 {
            registry.record_failure("flaky");
        }
        registry.record_success("flaky");

        let health = registry.health_of("flaky").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn selection_relaxes_when_every_provider_is_unhealthy() {
        let registry = ProviderRegistry::new();
        registry.add(record("only", 90.0, 1.0, &["historical"]));
        for _ in 0..5 {
            registry.record_failure("only");
        }

        let chosen = registry
            .select("getBlock", SelectionStrategy::Balanced)
            .unwrap();
        assert_eq!(chosen.id, "only");
    }

    #[test]
    fn runtime_additions_start_unknown() {
        let registry = ProviderRegistry::new();
        registry.add(record("new", 90.0, 1.0, &[]));
        let health = registry.health_of("new").unwrap();
        assert_eq!(health.status, HealthStatus::Unknown);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_check.is_none());
    }

    #[tokio::test]
    async fn probe_updates_health_from_the_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#)
            .create_async()
            .await;

        let registry = ProviderRegistry::new();
        let mut up = record("up", 90.0, 1.0, &[]);
        up.url = server.url();
        registry.add(up);
        let mut down = record("down", 90.0, 1.0, &[]);
        down.url = "http://127.0.0.1:1".to_string();
        registry.add(down);

        registry.probe(&reqwest::Client::new()).await;

        assert_eq!(
            registry.health_of("up").unwrap().status,
            HealthStatus::Healthy
        );
        let down_health = registry.health_of("down").unwrap();
        assert_eq!(down_health.status, HealthStatus::Unhealthy);
        assert_eq!(down_health.consecutive_failures, 1);
    }
}
