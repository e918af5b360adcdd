//! Prometheus metrics endpoint

use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// GET /metrics in Prometheus text format
async fn render_metrics() -> Response {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();

    match encoder.encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, encoder.format_type())], body).into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Router exposing `/metrics`; stateless so it can merge into any router.
pub fn metrics_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(render_metrics))
}
