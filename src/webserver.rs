use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;
use tracing::error;

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode_text() {
        Ok(body) => ([(CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to export metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_app(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(self::metrics))
        .with_state(metrics)
}
