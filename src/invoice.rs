//! Invoice lifecycle store: pending → consumed, TTL-bounded, replay-safe.
//!
//! Two backends sit behind one type. The preferred backend is an external
//! Redis-compatible REST KV with per-key TTLs; if it cannot be reached at
//! boot, or errors at runtime, the store falls open to an in-process map with
//! its own periodic sweep. The switch is one-way: the external backend is
//! never re-entered mid-process, since silently re-entering would split the
//! invoice space between the two backends.
//!
//! The critical invariant is the exactly-once `used` transition. On the KV
//! backend the claim is a `SET ... NX` on a side key (`payment:{id}:used`),
//! whose reply is the atomic arbiter between concurrent consumers. The memory
//! backend performs the read-modify-write under a single mutex.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::timestamp::UnixTimestamp;

/// How often the in-process backend evicts expired invoices.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Timeout for individual KV round-trips.
const KV_TIMEOUT: Duration = Duration::from_secs(5);

/// Billing terms minted for a single challenge. `amount`, `mint`,
/// `recipient`, and `method` never change after creation; only `used` and
/// `used_at` transition, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Decimal amount string, 6 fractional digits.
    pub amount: String,
    pub mint: String,
    pub recipient: String,
    /// Echoed JSON-RPC method, for observability only.
    pub method: String,
    pub created_at: UnixTimestamp,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<UnixTimestamp>,
}

impl Invoice {
    pub fn new(amount: String, mint: String, recipient: String, method: String) -> Self {
        Invoice {
            amount,
            mint,
            recipient,
            method,
            created_at: UnixTimestamp::now(),
            used: false,
            used_at: None,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed_secs() >= ttl.as_secs()
    }
}

/// Outcome of an atomic consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkUsed {
    /// This caller won the transition; `used_at` records the claim time.
    Claimed { used_at: UnixTimestamp },
    /// Another caller already consumed the invoice. `used_at` is unchanged.
    AlreadyUsed,
}

/// All store failures collapse into this one error; callers translate it to
/// `store_unavailable` (or a loud 500 when it strikes after verification).
#[derive(Debug, thiserror::Error)]
#[error("invoice store unavailable: {0}")]
pub struct StoreError(pub String);

/// Point-in-time store counters for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub used: u64,
    pub unused: u64,
    pub backend: &'static str,
}

/// The invoice store handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct InvoiceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    ttl: Duration,
    kv: Option<RedisKv>,
    /// Set once on the first KV failure; the process stays on memory after.
    degraded: AtomicBool,
    memory: Mutex<HashMap<Uuid, Invoice>>,
    created: AtomicU64,
    consumed: AtomicU64,
}

impl InvoiceStore {
    /// Store with only the in-process backend (external KV disabled).
    pub fn in_memory(ttl: Duration) -> Self {
        InvoiceStore {
            inner: Arc::new(StoreInner {
                ttl,
                kv: None,
                degraded: AtomicBool::new(false),
                memory: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
            }),
        }
    }

    /// Connects to the external KV when a URL is configured, probing it with
    /// a `PING`. Any failure falls open to the in-process backend; neither
    /// request path may fail because the preferred backend is unavailable.
    pub async fn connect(url: Option<&str>, token: Option<&str>, ttl: Duration) -> Self {
        let kv = match url {
            Some(url) if !url.trim().is_empty() => {
                let kv = RedisKv::new(url, token);
                match kv.ping().await {
                    Ok(()) => {
                        tracing::info!("invoice store using external KV backend");
                        Some(kv)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "invoice KV unreachable, using in-memory backend");
                        None
                    }
                }
            }
            _ => None,
        };
        InvoiceStore {
            inner: Arc::new(StoreInner {
                ttl,
                kv,
                degraded: AtomicBool::new(false),
                memory: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn backend(&self) -> &'static str {
        if self.kv().is_some() { "redis" } else { "memory" }
    }

    fn kv(&self) -> Option<&RedisKv> {
        if self.inner.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.inner.kv.as_ref()
    }

    fn degrade(&self, error: &StoreError) {
        if !self.inner.degraded.swap(true, Ordering::AcqRel) {
            tracing::error!(
                error = %error,
                "invoice KV failed, falling back to in-memory backend for the rest of the process"
            );
        }
    }

    /// Inserts a freshly minted invoice. Ids are generated by the caller with
    /// [`Uuid::new_v4`]; reusing an existing id is a programming error.
    pub async fn create(&self, payment_id: Uuid, invoice: Invoice) -> Result<(), StoreError> {
        if let Some(kv) = self.kv() {
            let json = serde_json::to_string(&invoice)
                .map_err(|e| StoreError(format!("invoice serialization failed: {e}")))?;
            match kv
                .set_ex(&invoice_key(payment_id), &json, self.inner.ttl)
                .await
            {
                Ok(()) => {
                    self.inner.created.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => self.degrade(&e),
            }
        }
        self.inner.memory.lock().insert(payment_id, invoice);
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Looks up an invoice. Absent and expired invoices are indistinguishable:
    /// both return `None`.
    pub async fn get(&self, payment_id: Uuid) -> Result<Option<Invoice>, StoreError> {
        if let Some(kv) = self.kv() {
            match self.get_from_kv(kv, payment_id).await {
                Ok(found) => return Ok(found),
                Err(e) => self.degrade(&e),
            }
        }
        let mut memory = self.inner.memory.lock();
        match memory.get(&payment_id) {
            Some(invoice) if invoice.is_expired(self.inner.ttl) => {
                memory.remove(&payment_id);
                Ok(None)
            }
            Some(invoice) => Ok(Some(invoice.clone())),
            None => Ok(None),
        }
    }

    async fn get_from_kv(
        &self,
        kv: &RedisKv,
        payment_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError> {
        let Some(json) = kv.get(&invoice_key(payment_id)).await? else {
            return Ok(None);
        };
        let mut invoice: Invoice = serde_json::from_str(&json)
            .map_err(|e| StoreError(format!("stored invoice is not parseable: {e}")))?;
        // The used flag lives on its own claim key; merge it into the view.
        if let Some(used_at) = kv.get(&used_key(payment_id)).await? {
            invoice.used = true;
            invoice.used_at = used_at.parse::<u64>().ok().map(UnixTimestamp::from_secs);
        }
        Ok(Some(invoice))
    }

    /// Atomically transitions the invoice to `used`. Exactly one concurrent
    /// caller observes [`MarkUsed::Claimed`]; everyone else gets
    /// [`MarkUsed::AlreadyUsed`] with `used_at` untouched.
    ///
    /// A KV transport failure here does NOT fall back to memory: the caller
    /// has already paid, and a silent backend switch could hand out a second
    /// claim. The error propagates for loud handling instead.
    pub async fn mark_used(&self, payment_id: Uuid) -> Result<MarkUsed, StoreError> {
        if let Some(kv) = self.kv() {
            let now = UnixTimestamp::now();
            let claimed = kv
                .set_nx_ex(&used_key(payment_id), &now.to_string(), self.inner.ttl)
                .await
                .inspect_err(|e| self.degrade(e))?;
            return if claimed {
                self.inner.consumed.fetch_add(1, Ordering::Relaxed);
                Ok(MarkUsed::Claimed { used_at: now })
            } else {
                Ok(MarkUsed::AlreadyUsed)
            };
        }

        let mut memory = self.inner.memory.lock();
        let invoice = memory
            .get_mut(&payment_id)
            .ok_or_else(|| StoreError("invoice disappeared before consumption".to_string()))?;
        if invoice.used {
            return Ok(MarkUsed::AlreadyUsed);
        }
        let now = UnixTimestamp::now();
        invoice.used = true;
        invoice.used_at = Some(now);
        self.inner.consumed.fetch_add(1, Ordering::Relaxed);
        Ok(MarkUsed::Claimed { used_at: now })
    }

    /// Unconditional removal.
    pub async fn delete(&self, payment_id: Uuid) -> Result<(), StoreError> {
        if let Some(kv) = self.kv() {
            match kv.del(&invoice_key(payment_id)).await {
                Ok(()) => {
                    let _ = kv.del(&used_key(payment_id)).await;
                    return Ok(());
                }
                Err(e) => self.degrade(&e),
            }
        }
        self.inner.memory.lock().remove(&payment_id);
        Ok(())
    }

    /// Process-local counters; observability only.
    pub fn stats(&self) -> StoreStats {
        let total = self.inner.created.load(Ordering::Relaxed);
        let used = self.inner.consumed.load(Ordering::Relaxed);
        StoreStats {
            total,
            used,
            unused: total.saturating_sub(used),
            backend: self.backend(),
        }
    }

    /// Evicts expired entries from the in-process map.
    pub fn sweep(&self) {
        let ttl = self.inner.ttl;
        let mut memory = self.inner.memory.lock();
        let before = memory.len();
        memory.retain(|_, invoice| !invoice.is_expired(ttl));
        let evicted = before - memory.len();
        if evicted > 0 {
            tracing::debug!(evicted, "swept expired invoices");
        }
    }

    /// Runs [`InvoiceStore::sweep`] every 15 minutes until cancelled.
    pub fn spawn_sweep(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => store.sweep(),
                }
            }
        })
    }
}

fn invoice_key(payment_id: Uuid) -> String {
    format!("payment:{payment_id}")
}

fn used_key(payment_id: Uuid) -> String {
    format!("payment:{payment_id}:used")
}

/// Minimal client for a Redis-compatible REST KV (Upstash wire shape):
/// commands are path segments, values travel in the request body, replies
/// come back as `{"result": ...}`.
struct RedisKv {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct RedisReply {
    result: Option<serde_json::Value>,
}

impl RedisKv {
    fn new(url: &str, token: Option<&str>) -> Self {
        RedisKv {
            base: url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(KV_TIMEOUT);
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn command(&self, builder: reqwest::RequestBuilder) -> Result<RedisReply, StoreError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| StoreError(format!("KV request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(StoreError(format!(
                "KV returned status {}",
                response.status()
            )));
        }
        response
            .json::<RedisReply>()
            .await
            .map_err(|e| StoreError(format!("KV reply not parseable: {e}")))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/ping", self.base);
        self.command(self.http.get(url)).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let url = format!("{}/get/{}", self.base, key);
        let reply = self.command(self.http.get(url)).await?;
        Ok(reply.result.and_then(|value| match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let url = format!("{}/set/{}?EX={}", self.base, key, ttl.as_secs());
        self.command(self.http.post(url).body(value.to_string()))
            .await
            .map(|_| ())
    }

    /// `SET key value NX EX ttl`; returns whether the key was newly written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let url = format!("{}/set/{}?EX={}&NX=true", self.base, key, ttl.as_secs());
        let reply = self
            .command(self.http.post(url).body(value.to_string()))
            .await?;
        Ok(!matches!(reply.result, None | Some(serde_json::Value::Null)))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let url = format!("{}/del/{}", self.base, key);
        self.command(self.http.post(url)).await.map(|_| ())
    }
}
