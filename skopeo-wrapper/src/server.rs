//! Minimal HTTP exposition of the metrics registry.
//!
//! Routes:
//!
//! - `GET /metrics` - Prometheus text exposition format
//! - `GET /health` - liveness, always `OK`
//!
//! Enabled with the `metrics-server` feature.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::MetricsRegistry;

/// Content type of the text exposition format.
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors raised by the metrics server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Metrics server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Router exposing `/metrics` and `/health`.
pub fn router(metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(metrics, listener, shutdown).await
}

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve_listener(
    metrics: Arc<MetricsRegistry>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let local = listener.local_addr()?;
    info!(addr = %local, "metrics server listening");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(addr = %local, "metrics server stopped");
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> Response {
    match metrics.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}
