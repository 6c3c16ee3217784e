use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cache_sdk::group::GroupStatsSnapshot;
use cache_sdk::CacheError;
use serde::Serialize;
use tracing::debug;

use crate::metrics;
use crate::protocol::{ErrorResponse, GetRequest, GetResponse, PEER_GET_PATH};
use crate::state::AppState;

#[derive(Serialize)]
struct StatsResponse {
    peer_id: String,
    uptime_secs: u64,
    peers: Vec<String>,
    groups: BTreeMap<String, GroupStatsSnapshot>,
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let groups = state
        .groups()
        .names()
        .into_iter()
        .filter_map(|name| {
            let group = state.groups().get(&name)?;
            Some((name, group.stats()))
        })
        .collect();
    Json(StatsResponse {
        peer_id: state.peer_id().to_string(),
        uptime_secs: state.uptime_secs(),
        peers: state.peers(),
        groups,
    })
}

async fn peer_get(State(state): State<AppState>, Json(request): Json<GetRequest>) -> Response {
    let Some(group) = state.groups().get(&request.group) else {
        metrics::PEER_REQUESTS
            .with_label_values(&["unknown_group"])
            .inc();
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no such group: {}", request.group),
        );
    };

    match group.get(&request.key).await {
        Ok(value) => {
            metrics::PEER_REQUESTS.with_label_values(&["ok"]).inc();
            (StatusCode::OK, Json(GetResponse::encode(value.as_slice()))).into_response()
        }
        Err(CacheError::InvalidKey) => {
            metrics::PEER_REQUESTS
                .with_label_values(&["invalid"])
                .inc();
            error_response(StatusCode::BAD_REQUEST, CacheError::InvalidKey.to_string())
        }
        Err(err) => {
            metrics::PEER_REQUESTS.with_label_values(&["error"]).inc();
            debug!(group = %request.group, key = %request.key, error = %err, "peer get failed");
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_handler))
        .route(PEER_GET_PATH, post(peer_get))
        .with_state(state)
}
