//! Pay-per-query HTTP gateway in front of a Solana archive.
//!
//! Every untrusted JSON-RPC request is answered with a machine-readable
//! `402 Payment Required` challenge naming the token, amount, recipient, and
//! an opaque `paymentId` nonce. After settling the micropayment on-chain the
//! caller retries with a base64-encoded receipt in the `X-Payment` header;
//! the gateway verifies the transfer, consumes the invoice, proxies the call
//! to the best available upstream provider, and returns the archive's
//! response together with an `X-Payment-Response` settlement receipt.
//!
//! # Modules
//!
//! - [`config`] — environment-derived gateway configuration.
//! - [`types`] — the wire contract: envelopes, challenges, receipt headers.
//! - [`pricing`] — deterministic `(method, params) → price` policy.
//! - [`invoice`] — the invoice lifecycle store (external KV with in-process
//!   fallback, TTL, atomic consumption).
//! - [`chain`] — confirmed-transaction lookup for the verifier.
//! - [`verifier`] — the on-chain payment verification algorithm.
//! - [`facilitator`] — optional external verify/settle collaborator.
//! - [`providers`] — upstream registry: health, scoring, selection.
//! - [`proxy`] — envelope forwarding with provider failover.
//! - [`gateway`] — the request pipeline binding it all together.
//! - [`handlers`] — the axum HTTP surface.
//! - [`telemetry`], [`sig_down`] — tracing export and graceful shutdown.

pub mod chain;
pub mod config;
pub mod facilitator;
pub mod gateway;
pub mod handlers;
pub mod invoice;
pub mod pricing;
pub mod providers;
pub mod proxy;
pub mod sig_down;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod verifier;
