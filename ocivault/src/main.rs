use std::net::SocketAddr;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use opentelemetry::metrics::MeterProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, Sampler},
    Resource,
};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, instrument, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use ocivault::api::routes;
use ocivault::api::AppMetrics;
use ocivault::config::AppConfig;
use ocivault::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let tracer = init_tracer()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(tracer) = tracer {
        Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .with(OpenTelemetryLayer::new(tracer))
            .init();
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    let config = AppConfig::load()?;
    info!(port = config.port, backend = %config.storage.backend, "loaded configuration");

    // Prometheus-backed metrics, scraped from /metrics.
    let prometheus_registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus_registry.clone())
        .build()?;
    let meter_provider = opentelemetry_sdk::metrics::MeterProvider::builder()
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", "ocivault"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .with_reader(exporter)
        .build();
    let meter = meter_provider.meter("ocivault");
    let metrics = AppMetrics::new(&meter);

    let port = config.port;
    let state = App::build(config, metrics).await?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || metrics_handler(prometheus_registry.clone())),
        )
        .merge(routes::registry_router(state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting ocivaultd on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    global::shutdown_tracer_provider();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

// Optional OTLP tracing, switched on by the standard endpoint variable.
fn init_tracer() -> anyhow::Result<Option<trace::Tracer>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(Resource::new(vec![
                        KeyValue::new("service.name", "ocivault"),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Ok(Some(tracer))
    } else {
        Ok(None)
    }
}

#[instrument(name = "metrics_handler", skip_all)]
async fn metrics_handler(registry: prometheus::Registry) -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {e}");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_string) => metrics_string.into_response(),
        Err(e) => {
            warn!("Failed to convert metrics to string: {e}");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to convert metrics to string",
            )
                .into_response()
        }
    }
}
