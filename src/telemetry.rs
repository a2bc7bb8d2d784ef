//! Tracing and metrics wiring.
//!
//! When any `OTEL_EXPORTER_OTLP_*` variable is present, spans and metrics are
//! exported over OTLP (HTTP or gRPC); otherwise the process logs locally
//! through `tracing-subscriber` with the usual `RUST_LOG` filtering.

use axum::http::{Request, Response};
use opentelemetry::trace::{Status, TracerProvider};
use opentelemetry::{KeyValue, Value, global};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use std::time::Duration;
use tower_http::trace::{MakeSpan, OnResponse, TraceLayer};
use tracing::Span;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer, OpenTelemetrySpanExt};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// OTLP transport, chosen by `OTEL_EXPORTER_OTLP_PROTOCOL`. HTTP when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    Http,
    Grpc,
}

impl OtlpProtocol {
    /// Returns the transport when telemetry export is enabled via the
    /// standard OTEL environment, `None` otherwise.
    fn from_env() -> Option<Self> {
        let enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !enabled {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(OtlpProtocol::Grpc),
            _ => Some(OtlpProtocol::Http),
        }
    }
}

/// Service identity attached to exported spans and metrics.
///
/// `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`, and `OTEL_SERVICE_DEPLOYMENT`
/// override the values set in code.
#[derive(Clone, Debug, Default)]
pub struct Telemetry {
    name: Option<Value>,
    version: Option<Value>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<Value>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<Value>) -> Self {
        self.version = Some(version.into());
        self
    }

    fn resource(&self) -> Resource {
        let name = env_value("OTEL_SERVICE_NAME").or_else(|| self.name.clone());
        let version = env_value("OTEL_SERVICE_VERSION").or_else(|| self.version.clone());
        let deployment = env_value("OTEL_SERVICE_DEPLOYMENT");

        let mut builder = Resource::builder();
        if let Some(name) = name {
            builder = builder.with_service_name(name);
        }
        let mut attributes = Vec::<KeyValue>::with_capacity(2);
        if let Some(version) = version {
            attributes.push(KeyValue::new(SERVICE_VERSION, version));
        }
        if let Some(deployment) = deployment {
            attributes.push(KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment));
        }
        if !attributes.is_empty() {
            builder = builder.with_schema_url(attributes, SCHEMA_URL);
        }
        builder.build()
    }

    fn init_tracer_provider(&self, protocol: OtlpProtocol) -> SdkTracerProvider {
        let exporter = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => exporter.with_http().build(),
            OtlpProtocol::Grpc => exporter.with_tonic().build(),
        };
        let exporter = exporter.expect("failed to build OTLP span exporter");

        SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                1.0,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build()
    }

    fn init_meter_provider(&self, protocol: OtlpProtocol) -> SdkMeterProvider {
        let exporter = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => exporter.with_http().build(),
            OtlpProtocol::Grpc => exporter.with_tonic().build(),
        };
        let exporter = exporter.expect("failed to build OTLP metric exporter");

        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(30))
            .build();
        let stdout_reader =
            PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build();

        let meter_provider = MeterProviderBuilder::default()
            .with_resource(self.resource())
            .with_reader(reader)
            .with_reader(stdout_reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        meter_provider
    }

    /// Installs the global tracing subscriber: OTLP layers when export is
    /// configured, plain fmt logging otherwise. The returned guard flushes
    /// exporters on drop.
    pub fn register(&self) -> TelemetryProviders {
        match OtlpProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = self.init_tracer_provider(protocol);
                let meter_provider = self.init_meter_provider(protocol);
                let tracer = tracer_provider.tracer("tracing-otel-subscriber");

                // INFO as the global floor keeps the exporter's own network
                // stack from re-entering the telemetry layer with its spans.
                tracing_subscriber::registry()
                    .with(tracing_subscriber::filter::LevelFilter::INFO)
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();

                tracing::info!(?protocol, "OTLP telemetry export enabled");
                TelemetryProviders {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                TelemetryProviders {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

fn env_value(key: &str) -> Option<Value> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(Value::from)
}

/// Guard over the active exporters; dropping it flushes pending telemetry.
pub struct TelemetryProviders {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryProviders {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}

impl TelemetryProviders {
    /// HTTP request tracing layer with gateway span shaping.
    pub fn http_tracing(
        &self,
    ) -> TraceLayer<
        tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
        GatewayMakeSpan,
        tower_http::trace::DefaultOnRequest,
        GatewayOnResponse,
    > {
        TraceLayer::new_for_http()
            .make_span_with(GatewayMakeSpan)
            .on_response(GatewayOnResponse)
    }
}

#[derive(Clone, Debug)]
pub struct GatewayMakeSpan;

impl<A> MakeSpan<A> for GatewayMakeSpan {
    fn make_span(&mut self, request: &Request<A>) -> Span {
        tracing::info_span!(
            "http_request",
            otel.kind = "server",
            otel.name = %format!("{} {}", request.method(), request.uri()),
            method = %request.method(),
            uri = %request.uri(),
        )
    }
}

#[derive(Clone, Debug)]
pub struct GatewayOnResponse;

impl<A> OnResponse<A> for GatewayOnResponse {
    fn on_response(self, response: &Response<A>, latency: Duration, span: &Span) {
        span.record("status", tracing::field::display(response.status()));
        span.record(
            "http.status_code",
            tracing::field::display(response.status().as_u16()),
        );
        if response.status().is_server_error() {
            span.set_status(Status::error(
                response
                    .status()
                    .canonical_reason()
                    .unwrap_or("unknown")
                    .to_string(),
            ));
        } else {
            span.set_status(Status::Ok);
        }
        tracing::debug!(
            "status={} elapsed={}ms",
            response.status().as_u16(),
            latency.as_millis()
        );
    }
}
