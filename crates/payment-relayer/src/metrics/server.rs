// HTTP surface for Prometheus scraping and operator status
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::RelayerMetrics;
use crate::error::RelayerError;
use crate::relay::RelayEngine;

#[derive(Clone)]
pub struct MetricsState {
    pub engine: Arc<RelayEngine>,
    pub metrics: Arc<RelayerMetrics>,
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .with_state(state)
}

/// Bind `host:port` and serve until shutdown is signalled
pub async fn serve(
    host: &str,
    port: u16,
    state: MetricsState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RelayerError> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Metrics(format!("failed to bind {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);
    serve_on(listener, state, shutdown).await
}

/// Background metrics server with its stop signal
pub struct MetricsServer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    pub fn spawn(host: String, port: u16, state: MetricsState) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(&host, port, state, stop_rx).await {
                warn!("Metrics server stopped: {}", e);
            }
        });
        Self { stop, handle }
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn shutdown(self) -> Result<(), RelayerError> {
        self.stop.send_replace(true);
        self.handle.await.map_err(|e| {
            RelayerError::Metrics(format!("metrics task ended abnormally: {}", e))
        })
    }
}

pub async fn serve_on(
    listener: TcpListener,
    state: MetricsState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayerError> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| RelayerError::Metrics(format!("metrics server error: {}", e)))
}

async fn get_metrics(State(state): State<MetricsState>) -> Response {
    // Refresh queue gauges before rendering
    if let Err(e) = state.engine.stats().await {
        error!("Failed to read queue stats for metrics: {}", e);
    }
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_stats(State(state): State<MetricsState>) -> Response {
    match state.engine.stats().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_health(State(state): State<MetricsState>) -> Json<serde_json::Value> {
    let stats = state.engine.relay_stats();
    Json(json!({
        "status": "ok",
        "running": state.engine.is_running(),
        "uptimeSeconds": stats.uptime().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicked_task_is_reported_on_shutdown() {
        let (stop, _stop_rx) = watch::channel(false);
        let handle: JoinHandle<()> = tokio::spawn(async { panic!("render blew up") });
        let server = MetricsServer { stop, handle };

        let err = server.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("ended abnormally"));
    }

    #[tokio::test]
    async fn test_clean_stop_is_ok() {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            while !*stop_rx.borrow() {
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        let server = MetricsServer { stop, handle };

        assert!(server.shutdown().await.is_ok());
    }
}
