use axum::Json;
use sysinfo::System;
use crate::models::HealthResponse;

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime: System::uptime(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
