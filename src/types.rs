//! Wire types for the pay-per-query protocol.
//!
//! The key objects are the inbound [`RpcEnvelope`], the `402 Payment Required`
//! challenge body ([`PaymentChallenge`] with its [`PaymentAccept`] entries),
//! the [`PaymentReceipt`] carried in the `X-Payment` request header, and the
//! [`SettlementReceipt`] returned in the `X-Payment-Response` header.
//!
//! Both payment headers are `base64(JSON(...))`; that encoding is the
//! compatibility contract with existing wallets and CLIs and must not change.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::borrow::Cow;
use std::fmt;
use std::fmt::Display;
use uuid::Uuid;

/// Name of the request header carrying a payment receipt.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Name of the response header carrying the settlement receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// JSON-RPC error code for a malformed request envelope.
pub const JSONRPC_INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code returned when every upstream provider failed.
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Upper bound on the `method` field of an inbound envelope.
pub const MAX_METHOD_LEN: usize = 100;
/// Upper bound on positional `params` entries of an inbound envelope.
pub const MAX_PARAMS_ITEMS: usize = 10;

/// An inbound or forwarded JSON-RPC 2.0 envelope.
///
/// The gateway never rewrites `jsonrpc`, `id`, `method`, or `params`; the
/// envelope that passed validation is the envelope the upstream receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Violations of the inbound envelope contract. All of them surface as
/// HTTP 400 with a JSON-RPC error of code [`JSONRPC_INVALID_REQUEST`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("jsonrpc must be \"2.0\"")]
    Version,
    #[error("id must be a string, number, or null")]
    Id,
    #[error("method must be between 1 and {MAX_METHOD_LEN} characters")]
    Method,
    #[error("params array must not exceed {MAX_PARAMS_ITEMS} items")]
    Params,
}

impl RpcEnvelope {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.jsonrpc != "2.0" {
            return Err(EnvelopeError::Version);
        }
        match &self.id {
            Value::String(_) | Value::Number(_) | Value::Null => {}
            _ => return Err(EnvelopeError::Id),
        }
        if self.method.is_empty() || self.method.len() > MAX_METHOD_LEN {
            return Err(EnvelopeError::Method);
        }
        if let Some(Value::Array(items)) = &self.params {
            if items.len() > MAX_PARAMS_ITEMS {
                return Err(EnvelopeError::Params);
            }
        }
        Ok(())
    }
}

/// Builds a JSON-RPC error envelope echoing the caller's `id`.
pub fn error_envelope(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Machine-readable error codes carried in payment-related response bodies.
///
/// The 402 variants are the protocol vocabulary shared with wallet clients;
/// `store_unavailable` and `internal_error` ride on 503 and 500 respectively.
/// `invalid_payment_id` stays in the vocabulary for wire compatibility even
/// though this implementation folds its case into `invalid_payment_payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorCode {
    PaymentRequired,
    InvalidPaymentHeader,
    InvalidPaymentPayload,
    InvalidPaymentId,
    PaymentAlreadyUsed,
    PaymentInvalid,
    StoreUnavailable,
    InternalError,
}

impl Display for PaymentErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentErrorCode::PaymentRequired => "payment_required",
            PaymentErrorCode::InvalidPaymentHeader => "invalid_payment_header",
            PaymentErrorCode::InvalidPaymentPayload => "invalid_payment_payload",
            PaymentErrorCode::InvalidPaymentId => "invalid_payment_id",
            PaymentErrorCode::PaymentAlreadyUsed => "payment_already_used",
            PaymentErrorCode::PaymentInvalid => "payment_invalid",
            PaymentErrorCode::StoreUnavailable => "store_unavailable",
            PaymentErrorCode::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// Enumerates payment schemes. Only "exact" is supported: the transferred
/// amount must match the invoiced amount (within the verifier's tolerance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Exact => write!(f, "exact"),
        }
    }
}

/// One way the caller may satisfy a challenge: the token, amount, recipient,
/// and the invoice nonce binding the payment to this gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAccept {
    pub asset: String,
    pub chain: String,
    /// Decimal string with exactly 6 fractional digits, e.g. `"0.001000"`.
    pub amount: String,
    pub payment_address: String,
    pub payment_id: Uuid,
    pub scheme: Scheme,
    /// Echo of the JSON-RPC method being priced.
    pub method: String,
}

/// Body of a `402 Payment Required` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChallenge {
    pub error: PaymentErrorCode,
    pub message: String,
    pub accepts: Vec<PaymentAccept>,
}

/// Body of the non-challenge payment errors (402 without a fresh invoice,
/// plus the 500/503 bodies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentErrorBody {
    pub error: PaymentErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

static TX_SIGNATURE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{80,100}$").expect("invalid tx signature regex")
});

/// The receipt a caller presents in the `X-Payment` header after settling the
/// invoiced transfer on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub tx_signature: String,
    pub payment_id: Uuid,
}

/// Why an `X-Payment` header was rejected. The two variants map onto the two
/// 402 codes the parse stage can produce.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    /// Not decodable at all: bad base64, bad UTF-8, or bad JSON.
    #[error("invalid payment header: {0}")]
    Header(String),
    /// Decodable but structurally wrong: missing or malformed fields.
    #[error("invalid payment payload: {0}")]
    Payload(String),
}

impl PaymentReceipt {
    /// Parses a raw `X-Payment` header value: `base64(JSON({txSignature, paymentId}))`.
    pub fn from_header(value: &str) -> Result<Self, ReceiptError> {
        let bytes = Base64Bytes::from(value.as_bytes())
            .decode()
            .map_err(|e| ReceiptError::Header(format!("base64 decode error: {e}")))?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawReceipt {
            #[serde(default)]
            tx_signature: Option<String>,
            #[serde(default)]
            payment_id: Option<String>,
        }

        let raw: RawReceipt = serde_json::from_slice(&bytes)
            .map_err(|e| ReceiptError::Header(format!("json parse error: {e}")))?;

        let tx_signature = raw
            .tx_signature
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ReceiptError::Payload("missing txSignature".to_string()))?;
        if !TX_SIGNATURE_REGEX.is_match(&tx_signature) {
            return Err(ReceiptError::Payload(
                "txSignature is not a transaction signature".to_string(),
            ));
        }

        let payment_id = raw
            .payment_id
            .ok_or_else(|| ReceiptError::Payload("missing paymentId".to_string()))?;
        let payment_id = Uuid::parse_str(&payment_id)
            .map_err(|_| ReceiptError::Payload("paymentId must be a UUID".to_string()))?;

        Ok(PaymentReceipt {
            tx_signature,
            payment_id,
        })
    }
}

/// Settlement summary returned to the caller in the `X-Payment-Response`
/// header of a successful (HTTP 200) proxied response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tx_signature: String,
    pub payment_id: Uuid,
    pub settled: bool,
}

impl SettlementReceipt {
    /// Encodes the receipt into its `base64(JSON(...))` header form.
    pub fn to_header_value(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        let encoded = Base64Bytes::encode(json);
        Ok(String::from_utf8(encoded.0.into_owned()).expect("base64 output is ASCII"))
    }
}

/// Contains bytes of base64 encoded some other bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes<'a>(pub Cow<'a, [u8]>);

impl Base64Bytes<'_> {
    /// Decode base64 string bytes to the raw binary payload.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(&self.0)
    }

    /// Encode raw binary input into base64 string bytes.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Base64Bytes<'static> {
        let encoded = b64.encode(input.as_ref());
        Base64Bytes(Cow::Owned(encoded.into_bytes()))
    }
}

impl AsRef<[u8]> for Base64Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> From<&'a [u8]> for Base64Bytes<'a> {
    fn from(slice: &'a [u8]) -> Self {
        Base64Bytes(Cow::Borrowed(slice))
    }
}

/// A simple error structure returned on unexpected or fatal server errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
