// src/server/metrics_server.rs

use crate::core::introspection::StatusMirror;
use crate::core::metrics::{self, gather_metrics};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// The locker gauge is refreshed from the status mirror before gathering.
async fn metrics_handler(mirror: Arc<StatusMirror>) -> impl IntoResponse {
    metrics::ACTIVE_LOCKERS.set(mirror.len() as f64);

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(
    mirror: Arc<StatusMirror>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = Router::new().route("/metrics", get(move || metrics_handler(mirror.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await;
    if let Err(e) = served {
        error!("Metrics server failed: {}", e);
    }
}
