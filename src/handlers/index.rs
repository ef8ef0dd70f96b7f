use axum::Json;
use serde_json::{Value, json};

// Plain JSON index of the routes
pub async fn index_handler() -> Json<Value> {
    Json(json!({
        "available_endpoints": {
            "/stats": "System statistics. Query: block=true|false, cache=true|false, fields=a,b,c",
            "/health": "Liveness check with host uptime",
            "/metrics": "Prometheus metrics for this service"
        }
    }))
}
