use crate::ingest::IngestPoint;
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use ringwatch_cluster::{PeerBatch, PEER_POINTS_PATH};
use ringwatch_common::stats::StatsSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope of every JSON answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 0 on success.
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub const ERR_INVALID_POINT: i32 = 1001;

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

pub fn error_response(status: StatusCode, trace_id: &str, code: i32, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: code,
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestReply {
    pub accepted: usize,
    pub rejected: usize,
    /// First rejection of the batch.
    pub error: Option<String>,
}

/// Accepts a batch of producer points. Partially valid batches succeed and
/// report the first rejection; a batch with no valid point is a 400.
async fn ingest_points(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    Json(points): Json<Vec<IngestPoint>>,
) -> Response {
    let outcome = state
        .ingest
        .ingest(points, ringwatch_common::now_secs())
        .await;
    if outcome.accepted == 0 {
        if let Some(e) = &outcome.first_error {
            return error_response(StatusCode::BAD_REQUEST, &trace_id, ERR_INVALID_POINT, &e.to_string());
        }
    }
    success_response(
        StatusCode::OK,
        &trace_id,
        IngestReply {
            accepted: outcome.accepted,
            rejected: outcome.rejected,
            error: outcome.first_error.map(|e| e.to_string()),
        },
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerReply {
    pub accepted: usize,
}

/// Points forwarded by the peer that ingested them; already enriched.
async fn peer_points(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    Json(batch): Json<PeerBatch>,
) -> Response {
    let accepted = batch.points.len();
    tracing::debug!(from = %batch.from, points = accepted, "Peer batch received");
    state.local.deliver(batch.points).await;
    success_response(StatusCode::OK, &trace_id, PeerReply { accepted })
}

#[derive(Debug, Serialize)]
pub struct HealthReply {
    pub instance_id: String,
    pub cluster: String,
    pub version: String,
    pub uptime_secs: i64,
    pub ring_members: Vec<String>,
    pub rules_version: u64,
    pub active_events: usize,
    pub stats: StatsSnapshot,
}

async fn health(State(state): State<AppState>, Extension(trace_id): Extension<TraceId>) -> Response {
    let reply = HealthReply {
        instance_id: state.instance_id.clone(),
        cluster: state.cluster.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.start_time).num_seconds(),
        ring_members: state.ring.load().members().to_vec(),
        rules_version: state.rules.snapshot().version,
        active_events: state.events.len().await,
        stats: state.stats.snapshot(),
    };
    success_response(StatusCode::OK, &trace_id, reply)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ingest", post(ingest_points))
        .route(PEER_POINTS_PATH, post(peer_points))
}
