//! Gateway HTTP entrypoint.
//!
//! Launches the axum server that prices, challenges, verifies, and proxies
//! JSON-RPC traffic:
//! - `POST /` — the billed JSON-RPC entry point (402 challenge / paid proxy)
//! - `GET /` — service banner
//! - `GET /health` — invoice-store and provider-pool liveness
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `PORT` controls the listen port; see `config` for the full option set
//! - `OTEL_*` variables enable OTLP trace/metric export

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use solgate::config::GatewayConfig;
use solgate::gateway::{Gateway, seeded_registry};
use solgate::handlers;
use solgate::invoice::InvoiceStore;
use solgate::sig_down::SigDown;
use solgate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let store = InvoiceStore::connect(
        config.invoice_store_url.as_deref(),
        config.invoice_store_token.as_deref(),
        config.invoice_ttl,
    )
    .await;
    tracing::info!(backend = store.backend(), "invoice store ready");

    let registry = seeded_registry(&config);
    let port = config.port;
    let gateway = Arc::new(Gateway::new(config, store.clone(), registry.clone()));

    let sig_down = SigDown::try_new()?;
    store.spawn_sweep(sig_down.cancellation_token());
    registry.clone().spawn_probe_loop(sig_down.cancellation_token());

    let app = Router::new()
        .merge(handlers::routes())
        .with_state(gateway)
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting gateway at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    let cancellation_token = sig_down.cancellation_token();
    let graceful_shutdown = async move { cancellation_token.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    Ok(())
}
