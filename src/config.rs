//! Environment-driven configuration for the gateway.
//!
//! All recognized options are read from environment variables (a `.env` file
//! is loaded by the entrypoint before this runs). Addresses are validated as
//! Solana pubkeys and URLs are parsed at boot so misconfiguration fails fast
//! instead of surfacing mid-request.

use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::pricing;

pub const ENV_PORT: &str = "PORT";
pub const ENV_PAYMENT_WALLET_ADDRESS: &str = "PAYMENT_WALLET_ADDRESS";
pub const ENV_BILLING_MINT: &str = "BILLING_MINT";
pub const ENV_BILLING_ASSET: &str = "BILLING_ASSET";
pub const ENV_PRICE_PER_QUERY: &str = "PRICE_PER_QUERY";
/// Prefix for per-method base price overrides, e.g. `PRICE_GETBLOCK=0.002`.
pub const ENV_PRICE_PREFIX: &str = "PRICE_";
pub const ENV_CHAIN_RPC_URL: &str = "CHAIN_RPC_URL";
pub const ENV_UPSTREAM_DEFAULT_URL: &str = "UPSTREAM_DEFAULT_URL";
pub const ENV_UPSTREAM_FALLBACK_URL: &str = "UPSTREAM_FALLBACK_URL";
pub const ENV_USE_FALLBACK: &str = "USE_FALLBACK";
pub const ENV_PREFER_CHEAPEST: &str = "PREFER_CHEAPEST";
pub const ENV_FACILITATOR_VERIFY_URL: &str = "FACILITATOR_VERIFY_URL";
pub const ENV_FACILITATOR_SETTLE_URL: &str = "FACILITATOR_SETTLE_URL";
pub const ENV_INVOICE_STORE_URL: &str = "INVOICE_STORE_URL";
pub const ENV_INVOICE_STORE_TOKEN: &str = "INVOICE_STORE_TOKEN";
pub const ENV_INVOICE_TTL_SECONDS: &str = "INVOICE_TTL_SECONDS";
pub const ENV_RATE_LIMIT_WINDOW_MS: &str = "RATE_LIMIT_WINDOW_MS";
pub const ENV_RATE_LIMIT_MAX: &str = "RATE_LIMIT_MAX";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BILLING_ASSET: &str = "USDC";
/// Invoices expire 15 minutes after they are minted.
const DEFAULT_INVOICE_TTL_SECONDS: u64 = 900;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;

/// Chain tag advertised in challenges and settlement notifications. The
/// gateway serves exactly one chain.
pub const CHAIN_TAG: &str = "solana";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {0} is not set")]
    Missing(&'static str),
    #[error("env {key} is not a valid Solana address: {value}")]
    InvalidAddress { key: &'static str, value: String },
    #[error("env {key} is not a valid URL: {value}")]
    InvalidUrl { key: String, value: String },
    #[error("env {key} is not a valid number: {value}")]
    InvalidNumber { key: String, value: String },
    #[error("env {key} is not a valid price: {value}")]
    InvalidPrice { key: String, value: String },
}

/// Resolved gateway configuration. One instance per process, owned by the
/// pipeline; nothing here changes after startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Recipient address advertised as `paymentAddress` in 402 challenges.
    pub payment_wallet_address: String,
    /// The only token mint the verifier accepts.
    pub billing_mint: String,
    /// Token symbol advertised as `asset` in 402 challenges.
    pub billing_asset: String,
    /// Base price for methods absent from the pricing table.
    pub price_per_query: Decimal,
    /// Per-method base price overrides, keyed by method name.
    pub method_prices: HashMap<String, Decimal>,
    /// Endpoint used for on-chain transaction lookups.
    pub chain_rpc_url: String,
    pub upstream_default_url: String,
    pub upstream_fallback_url: Option<String>,
    pub use_fallback: bool,
    /// Score providers with the cheapest formula instead of the balanced one.
    pub prefer_cheapest: bool,
    pub facilitator_verify_url: Option<String>,
    pub facilitator_settle_url: Option<String>,
    /// External KV endpoint for the invoice store; `None` keeps invoices
    /// purely in-process.
    pub invoice_store_url: Option<String>,
    pub invoice_store_token: Option<String>,
    pub invoice_ttl: Duration,
    /// Consumed by the surrounding rate-limit middleware, not by the core.
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let payment_wallet_address = require(ENV_PAYMENT_WALLET_ADDRESS)?;
        validate_address(ENV_PAYMENT_WALLET_ADDRESS, &payment_wallet_address)?;
        let billing_mint = require(ENV_BILLING_MINT)?;
        validate_address(ENV_BILLING_MINT, &billing_mint)?;

        let chain_rpc_url = require(ENV_CHAIN_RPC_URL)?;
        validate_url(ENV_CHAIN_RPC_URL, &chain_rpc_url)?;
        let upstream_default_url = require(ENV_UPSTREAM_DEFAULT_URL)?;
        validate_url(ENV_UPSTREAM_DEFAULT_URL, &upstream_default_url)?;

        let upstream_fallback_url = optional(ENV_UPSTREAM_FALLBACK_URL);
        if let Some(url) = &upstream_fallback_url {
            validate_url(ENV_UPSTREAM_FALLBACK_URL, url)?;
        }
        let facilitator_verify_url = optional(ENV_FACILITATOR_VERIFY_URL);
        if let Some(url) = &facilitator_verify_url {
            validate_url(ENV_FACILITATOR_VERIFY_URL, url)?;
        }
        let facilitator_settle_url = optional(ENV_FACILITATOR_SETTLE_URL);
        if let Some(url) = &facilitator_settle_url {
            validate_url(ENV_FACILITATOR_SETTLE_URL, url)?;
        }
        let invoice_store_url = optional(ENV_INVOICE_STORE_URL);
        if let Some(url) = &invoice_store_url {
            validate_url(ENV_INVOICE_STORE_URL, url)?;
        }

        let price_per_query = match optional(ENV_PRICE_PER_QUERY) {
            Some(raw) => parse_price(ENV_PRICE_PER_QUERY, &raw)?,
            None => pricing::default_price_per_query(),
        };

        Ok(GatewayConfig {
            port: parse_or(ENV_PORT, DEFAULT_PORT)?,
            payment_wallet_address,
            billing_mint,
            billing_asset: optional(ENV_BILLING_ASSET)
                .unwrap_or_else(|| DEFAULT_BILLING_ASSET.to_string()),
            price_per_query,
            method_prices: method_prices_from_env()?,
            chain_rpc_url,
            upstream_default_url,
            upstream_fallback_url,
            use_fallback: flag(ENV_USE_FALLBACK),
            prefer_cheapest: flag(ENV_PREFER_CHEAPEST),
            facilitator_verify_url,
            facilitator_settle_url,
            invoice_store_url,
            invoice_store_token: optional(ENV_INVOICE_STORE_TOKEN),
            invoice_ttl: Duration::from_secs(parse_or(
                ENV_INVOICE_TTL_SECONDS,
                DEFAULT_INVOICE_TTL_SECONDS,
            )?),
            rate_limit_window_ms: parse_or(ENV_RATE_LIMIT_WINDOW_MS, DEFAULT_RATE_LIMIT_WINDOW_MS)?,
            rate_limit_max: parse_or(ENV_RATE_LIMIT_MAX, DEFAULT_RATE_LIMIT_MAX)?,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn flag(key: &str) -> bool {
    optional(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_price(key: &str, raw: &str) -> Result<Decimal, ConfigError> {
    let price = Decimal::from_str(raw).map_err(|_| ConfigError::InvalidPrice {
        key: key.to_string(),
        value: raw.to_string(),
    })?;
    if price.is_sign_negative() {
        return Err(ConfigError::InvalidPrice {
            key: key.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(price)
}

fn validate_address(key: &'static str, value: &str) -> Result<(), ConfigError> {
    Pubkey::from_str(value).map_err(|_| ConfigError::InvalidAddress {
        key,
        value: value.to_string(),
    })?;
    Ok(())
}

fn validate_url(key: &str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    Ok(())
}

/// Collects `PRICE_<METHOD>` overrides from the environment. Method names are
/// matched case-insensitively by the pricing table.
fn method_prices_from_env() -> Result<HashMap<String, Decimal>, ConfigError> {
    let mut prices = HashMap::new();
    for (key, value) in env::vars() {
        if key == ENV_PRICE_PER_QUERY || !key.starts_with(ENV_PRICE_PREFIX) {
            continue;
        }
        let method = key[ENV_PRICE_PREFIX.len()..].to_string();
        if method.is_empty() {
            continue;
        }
        let price = parse_price(&key, &value)?;
        prices.insert(method, price);
    }
    Ok(prices)
}
