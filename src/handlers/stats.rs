use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::ACCEPT_ENCODING;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::compression::accepts_gzip;
use crate::models::StatsParams;
use crate::pipeline::{StatsReply, StatsRequest};
use crate::state::AppState;

// Rate limiting is keyed on the peer IP; requests without connection info share one bucket
fn client_id(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    request: Request,
) -> StatsReply {
    let params = StatsParams::from_pairs(pairs);
    let gzip_accepted = request
        .headers()
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(accepts_gzip);

    let req = StatsRequest {
        client_id: client_id(&request),
        block: params.block(),
        use_cache: params.use_cache(),
        fields: params.fields(),
        accepts_gzip: gzip_accepted,
    };

    state.pipeline.handle(req).await
}
