//! HTTP surface: Prometheus scrape endpoint and a health check.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metrics::MetricsStore;

/// Content type of the Prometheus text exposition format.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Routes `/metrics` to the latest published snapshot of `store` and
/// `/healthz` to a static `ok`.
pub fn router(store: Arc<MetricsStore>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(store)
}

async fn metrics(State(store): State<Arc<MetricsStore>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, METRICS_CONTENT_TYPE)], store.render())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Parses a listen address. A bare `:port` listens on all interfaces.
pub fn parse_bind(bind: &str) -> Result<SocketAddr> {
    let bind = bind.trim();
    let full = if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    };

    full.parse()
        .map_err(|e| Error::Config(format!("invalid bind address '{}': {}", bind, e)))
}
