//! HTTP route handlers.
//!
//! JSON in, JSON out. Mutating endpoints return the full status document;
//! creates return the created entity. Errors map to status codes through
//! [`ApiError::status_code`](crate::error::ApiError::status_code).

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use crate::model::{
    Group, GroupUpdate, NewGroup, NewPreset, NewStream, Preset, PresetUpdate, Source,
    SourceUpdate, Status, Stream, StreamUpdate, Zone, ZoneUpdate,
};
use crate::stream::{StreamCommand, StreamInfo};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(get_status))
        .route("/api/", get(get_status))
        .route("/api/sources", get(get_sources))
        .route("/api/sources/{sid}", get(get_source).patch(patch_source))
        .route("/api/zones", get(get_zones))
        .route("/api/zones/{zid}", get(get_zone).patch(patch_zone))
        .route("/api/group", post(post_group))
        .route("/api/groups", get(get_groups))
        .route(
            "/api/groups/{gid}",
            get(get_group).patch(patch_group).delete(delete_group),
        )
        .route("/api/stream", post(post_stream))
        .route("/api/streams", get(get_streams))
        .route(
            "/api/streams/{sid}",
            get(get_stream).patch(patch_stream).delete(delete_stream),
        )
        .route("/api/streams/{sid}/info", get(get_stream_info))
        .route("/api/streams/{sid}/{cmd}", post(post_stream_command))
        .route("/api/preset", post(post_preset))
        .route("/api/presets", get(get_presets))
        .route(
            "/api/presets/{pid}",
            get(get_preset).patch(patch_preset).delete(delete_preset),
        )
        .route("/api/presets/{pid}/load", post(load_preset))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// The full system status and configuration.
async fn get_status(State(state): State<AppState>) -> Json<Status> {
    Json(state.ctrl.get_state())
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

async fn get_sources(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "sources": state.ctrl.get_state().sources }))
}

async fn get_source(
    State(state): State<AppState>,
    Path(sid): Path<usize>,
) -> ApiResult<Json<Source>> {
    state
        .ctrl
        .get_state()
        .sources
        .get(sid)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("source {}", sid)))
}

async fn patch_source(
    State(state): State<AppState>,
    Path(sid): Path<usize>,
    Json(update): Json<SourceUpdate>,
) -> ApiResult<Json<Status>> {
    state.ctrl.set_source(sid, &update).await.map(Json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Zones
// ─────────────────────────────────────────────────────────────────────────────

async fn get_zones(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "zones": state.ctrl.get_state().zones }))
}

async fn get_zone(
    State(state): State<AppState>,
    Path(zid): Path<usize>,
) -> ApiResult<Json<Zone>> {
    state
        .ctrl
        .get_state()
        .zones
        .get(zid)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("zone {}", zid)))
}

async fn patch_zone(
    State(state): State<AppState>,
    Path(zid): Path<usize>,
    Json(update): Json<ZoneUpdate>,
) -> ApiResult<Json<Status>> {
    state.ctrl.set_zone(zid, &update).await.map(Json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Groups
// ─────────────────────────────────────────────────────────────────────────────

async fn post_group(
    State(state): State<AppState>,
    Json(new): Json<NewGroup>,
) -> ApiResult<Json<Group>> {
    state.ctrl.create_group(new).await.map(Json)
}

async fn get_groups(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "groups": state.ctrl.get_state().groups }))
}

async fn get_group(
    State(state): State<AppState>,
    Path(gid): Path<u64>,
) -> ApiResult<Json<Group>> {
    state
        .ctrl
        .get_state()
        .find_group(gid)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("group {}", gid)))
}

async fn patch_group(
    State(state): State<AppState>,
    Path(gid): Path<u64>,
    Json(update): Json<GroupUpdate>,
) -> ApiResult<Json<Status>> {
    state.ctrl.set_group(gid, &update).await.map(Json)
}

async fn delete_group(
    State(state): State<AppState>,
    Path(gid): Path<u64>,
) -> ApiResult<Json<Status>> {
    state.ctrl.delete_group(gid).await.map(Json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Streams
// ─────────────────────────────────────────────────────────────────────────────

async fn post_stream(
    State(state): State<AppState>,
    Json(new): Json<NewStream>,
) -> ApiResult<Json<Stream>> {
    state.ctrl.create_stream(new).await.map(Json)
}

async fn get_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "streams": state.ctrl.get_state().streams }))
}

async fn get_stream(
    State(state): State<AppState>,
    Path(sid): Path<u64>,
) -> ApiResult<Json<Stream>> {
    state
        .ctrl
        .get_state()
        .find_stream(sid)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("stream {}", sid)))
}

async fn patch_stream(
    State(state): State<AppState>,
    Path(sid): Path<u64>,
    Json(update): Json<StreamUpdate>,
) -> ApiResult<Json<Status>> {
    state.ctrl.set_stream(sid, &update).await.map(Json)
}

async fn delete_stream(
    State(state): State<AppState>,
    Path(sid): Path<u64>,
) -> ApiResult<Json<Status>> {
    state.ctrl.delete_stream(sid).await.map(Json)
}

/// Now-playing metadata for a stream, straight from its driver.
async fn get_stream_info(
    State(state): State<AppState>,
    Path(sid): Path<u64>,
) -> ApiResult<Json<StreamInfo>> {
    state.ctrl.stream_info(sid).await.map(Json)
}

/// Executes a playback command (`play`, `pause`, `next`, `stop`, `love`,
/// `ban`, `shelve`, or `station=<id>` for Pandora station selection).
async fn post_stream_command(
    State(state): State<AppState>,
    Path((sid, cmd)): Path<(u64, String)>,
) -> ApiResult<Json<Status>> {
    let cmd: StreamCommand = cmd.parse().map_err(ApiError::InvalidField)?;
    state.ctrl.exec_stream_command(sid, &cmd).await.map(Json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Presets
// ─────────────────────────────────────────────────────────────────────────────

async fn post_preset(
    State(state): State<AppState>,
    Json(new): Json<NewPreset>,
) -> ApiResult<Json<Preset>> {
    state.ctrl.create_preset(new).await.map(Json)
}

async fn get_presets(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "presets": state.ctrl.get_state().presets }))
}

async fn get_preset(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
) -> ApiResult<Json<Preset>> {
    state
        .ctrl
        .get_state()
        .find_preset(pid)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("preset {}", pid)))
}

async fn patch_preset(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
    Json(update): Json<PresetUpdate>,
) -> ApiResult<Json<Status>> {
    state.ctrl.set_preset(pid, &update).await.map(Json)
}

async fn delete_preset(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
) -> ApiResult<Json<Status>> {
    state.ctrl.delete_preset(pid).await.map(Json)
}

/// Applies a preset's configuration atomically.
async fn load_preset(
    State(state): State<AppState>,
    Path(pid): Path<u64>,
) -> ApiResult<Json<Status>> {
    state.ctrl.load_preset(pid).await.map(Json)
}
