//! Prometheus scrape endpoint and health probe.
//!
//! `GET /metrics` returns the text-format export; `GET /healthz` maps the
//! readiness gate to 200/503 so an orchestration layer can hold traffic
//! while the container runtime is down.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ixo_core::telemetry::Metrics;
use tracing::info;

use crate::readiness::ReadinessGate;

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct HttpState {
    /// Metrics handle to export.
    pub metrics: Arc<Metrics>,
    /// Readiness gate to report.
    pub gate: ReadinessGate,
}

/// Builds the router.
#[must_use]
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        ),
    }
}

async fn healthz_handler(State(state): State<HttpState>) -> impl IntoResponse {
    if state.gate.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "container runtime unavailable")
    }
}

/// Serves the HTTP surface until the process exits.
///
/// # Errors
///
/// Returns an error if the listen address cannot be bound.
pub async fn serve(addr: &str, state: HttpState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(ready: bool) -> HttpState {
        HttpState {
            metrics: Arc::new(Metrics::new().unwrap()),
            gate: ReadinessGate::new(ready),
        }
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exports_text() {
        let state = state(true);
        state.metrics.timed_out();
        let app = router(state);
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("ixo_timed_out_total 1"));
    }

    #[tokio::test]
    async fn test_healthz_reflects_gate() {
        let ready = router(state(true));
        let response = ready
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let not_ready = router(state(false));
        let response = not_ready
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
