//! HTTP endpoints of the gateway.
//!
//! `POST /` is the billed JSON-RPC entry point; `GET /` returns a service
//! banner and `GET /health` a liveness snapshot of the store and the
//! provider pool.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use crate::gateway::{Gateway, GatewayError, RpcReply};
use crate::invoice::StoreStats;
use crate::providers::ProviderHealth;
use crate::types::{
    JSONRPC_INVALID_REQUEST, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER, PaymentErrorBody,
    PaymentErrorCode, RpcEnvelope, error_envelope,
};

pub fn routes() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/", get(get_root))
        .route("/", post(post_rpc))
        .route("/health", get(get_health))
}

/// `GET /`: service banner.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    let pkg_version = env!("CARGO_PKG_VERSION");
    (StatusCode::OK, format!("{pkg_name} {pkg_version}"))
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    store: StoreStats,
    providers: Vec<ProviderHealthEntry>,
}

#[derive(Serialize)]
struct ProviderHealthEntry {
    id: String,
    #[serde(flatten)]
    health: ProviderHealth,
}

/// `GET /health`: liveness snapshot of the invoice-store counters and
/// per-provider health.
#[instrument(skip_all)]
pub async fn get_health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let providers = gateway
        .registry()
        .health_snapshot()
        .into_iter()
        .map(|(id, health)| ProviderHealthEntry { id, health })
        .collect();
    Json(HealthBody {
        status: "ok",
        store: gateway.store().stats(),
        providers,
    })
}

/// `POST /`: the billed JSON-RPC entry point.
///
/// The envelope is validated first (violations are the caller's fault: HTTP
/// 400 with a `-32600` JSON-RPC error), then handed to the payment pipeline
/// together with the raw `X-Payment` header, if any.
#[instrument(skip_all)]
pub async fn post_rpc(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: RpcEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_envelope(
                    &Value::Null,
                    JSONRPC_INVALID_REQUEST,
                    &format!("Invalid JSON-RPC request: {e}"),
                )),
            )
                .into_response();
        }
    };
    if let Err(violation) = envelope.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(error_envelope(
                &envelope.id,
                JSONRPC_INVALID_REQUEST,
                &format!("Invalid JSON-RPC request: {violation}"),
            )),
        )
            .into_response();
    }

    let payment_header = match headers.get(PAYMENT_HEADER) {
        Some(value) => match value.to_str() {
            Ok(value) => Some(value),
            Err(_) => {
                return GatewayError::Payment {
                    code: PaymentErrorCode::InvalidPaymentHeader,
                    message: "X-Payment header is not decodable".to_string(),
                    details: Some("header value is not valid UTF-8".to_string()),
                }
                .into_response();
            }
        },
        None => None,
    };

    match gateway.handle(payment_header, envelope).await {
        Ok(reply) => reply.into_response(),
        Err(error) => error.into_response(),
    }
}

impl IntoResponse for RpcReply {
    fn into_response(self) -> Response {
        match self {
            RpcReply::Challenge(challenge) => {
                (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response()
            }
            RpcReply::Proxied { body, receipt } => match receipt.to_header_value() {
                Ok(header) => (
                    StatusCode::OK,
                    [(PAYMENT_RESPONSE_HEADER, header)],
                    Json(body),
                )
                    .into_response(),
                Err(e) => {
                    tracing::error!(error = %e, "settlement receipt not encodable, header omitted");
                    (StatusCode::OK, Json(body)).into_response()
                }
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Payment {
                code,
                message,
                details,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(PaymentErrorBody {
                    error: code,
                    message,
                    details,
                }),
            )
                .into_response(),
            GatewayError::StoreUnavailable(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(PaymentErrorBody {
                    error: PaymentErrorCode::StoreUnavailable,
                    message: e.to_string(),
                    details: None,
                }),
            )
                .into_response(),
            GatewayError::Consume { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PaymentErrorBody {
                    error: PaymentErrorCode::InternalError,
                    message: "Failed to record payment consumption".to_string(),
                    details: None,
                }),
            )
                .into_response(),
        }
    }
}
