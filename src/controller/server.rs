//! # HTTP Server
//!
//! Metrics and health probe endpoints.
//!
//! - `/metrics` - Prometheus text format
//! - `/healthz` - Liveness, always 200 while the process serves requests
//! - `/readyz` - Readiness, 200 once the server is bound

use crate::observability;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state for the probe handlers
#[derive(Debug, Default)]
pub struct ServerState {
    pub is_ready: Arc<AtomicBool>,
}

async fn metrics_handler() -> Response {
    match observability::metrics::gather_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<ServerState>>) -> Response {
    if state.is_ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the process exits
///
/// `state.is_ready` flips to true once the listener is bound.
pub async fn start_server(port: u16, state: Arc<ServerState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "HTTP server listening for metrics and probes");
    state.is_ready.store(true, Ordering::Relaxed);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_status(state: Arc<ServerState>, path: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_readyz_follows_ready_flag() {
        let state = Arc::new(ServerState::default());
        let (status, _) = get_status(Arc::clone(&state), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.is_ready.store(true, Ordering::Relaxed);
        let (status, body) = get_status(state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");
    }

    #[tokio::test]
    async fn test_healthz_and_metrics() {
        observability::metrics::register_metrics().ok();
        observability::metrics::increment_reconciliations();

        let state = Arc::new(ServerState::default());
        let (status, _) = get_status(Arc::clone(&state), "/healthz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_status(state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("reconciliations"));
    }
}
