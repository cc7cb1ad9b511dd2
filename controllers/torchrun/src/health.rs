//! Probe and metrics server
//!
//! - `/healthz` - liveness (the process answers)
//! - `/readyz` - readiness (watchers started)
//! - `/metrics` - Prometheus text format

use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state of the probe server
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Arc<Metrics>,
}

impl HealthState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

/// Create the probe server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve probes and metrics on `addr` until the process exits.
pub async fn run_health_server(addr: SocketAddr, state: Arc<HealthState>) -> Result<(), ControllerError> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<HealthState> {
        Arc::new(HealthState::new(Arc::new(Metrics::new().unwrap())))
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = state();
        assert_eq!(readyz(State(state.clone())).await.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        assert_eq!(readyz(State(state.clone())).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_format() {
        let state = state();
        state.metrics.record_reconcile("TorchrunJob", "success");

        let response = metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/plain; version=0.0.4; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn test_liveness() {
        assert_eq!(healthz().await.into_response().status(), StatusCode::OK);
    }
}
