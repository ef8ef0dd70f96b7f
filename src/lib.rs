//! pistat: machine metrics over HTTP behind a per-client rate limiter and a
//! short-lived snapshot cache.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Endpoint index |
//! | GET | `/stats` | Snapshot of system statistics (`block`, `cache`, `fields`) |
//! | GET | `/health` | Liveness and host uptime |
//! | GET | `/metrics` | Prometheus exposition |

pub mod cache;
pub mod collectors;
pub mod compression;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod snapshot;
pub mod state;

use axum::Router;
use axum::routing::get;
use std::sync::Arc;
use crate::state::AppState;

/// Build the router with every route.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index_handler))
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
