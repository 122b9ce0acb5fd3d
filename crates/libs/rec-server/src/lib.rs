//! Telemetry surface: Prometheus metrics exposition and a health probe.
//!
//! The Prometheus recorder installs process-wide exactly once; repeated
//! calls to [`setup_metrics`] return the existing handle, so tests and the
//! binary can both call it freely.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use rec_common::config::MetricsConfig;
use rec_common::error::Result;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder with the configured constant labels.
/// Subsequent calls are no-ops returning the existing handle.
#[allow(clippy::expect_used)] // Recorder setup is infallible in practice; panic acceptable at startup
pub fn setup_metrics(labels: &HashMap<String, String>) -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let mut builder = PrometheusBuilder::new();
            for (key, value) in labels {
                builder = builder.add_global_label(key, value);
            }
            builder
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

#[derive(Clone)]
struct AppState {
    handle: PrometheusHandle,
    start_time: Instant,
}

/// Serve the metrics and health endpoints until `token` is cancelled.
pub async fn serve(config: MetricsConfig, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "Metrics server on http://{}{}",
        addr,
        config.path
    );
    serve_with_listener(listener, config, token).await
}

/// Like [`serve`] but over an already-bound listener (ephemeral ports in
/// tests).
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    config: MetricsConfig,
    token: CancellationToken,
) -> Result<()> {
    let state = AppState {
        handle: setup_metrics(&config.labels),
        start_time: Instant::now(),
    };

    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.handle.render(),
    )
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
