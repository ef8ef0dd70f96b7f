use axum::http::StatusCode;
use crate::metrics;

pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}
