// HTTP API module - the control-plane REST surface
//
// Thin dispatchers over the stores and the broker: handlers validate,
// delegate, and serialize. Anything that mutates captures also publishes
// the mutation on the event broker so live viewers stay in sync. All
// endpoints return JSON and are designed for local consumption only.

mod sse;

use crate::analysis::AnalysisSink;
use crate::broker::EventBroker;
use crate::capture::Capture;
use crate::filter::Filter;
use crate::rules::{ColorRule, ColorRuleStore};
use crate::search::{SearchHistoryItem, SearchHistoryStore};
use crate::store::CaptureStore;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared state injected into every handler. Everything is an Arc handed
/// down from main; no package-level globals.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CaptureStore>,
    pub broker: Arc<EventBroker>,
    pub rules: Arc<ColorRuleStore>,
    pub searches: Arc<SearchHistoryStore>,
    pub sink: Arc<AnalysisSink>,
    pub paused: Arc<AtomicBool>,
}

/// Build the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/captures", get(list_captures).delete(clear_captures))
        .route(
            "/api/captures/:id",
            get(get_capture).delete(delete_capture).patch(rename_capture),
        )
        .route("/api/data", get(get_data))
        .route("/api/rules", get(get_rules).put(put_rules))
        .route("/api/pause", get(get_pause).post(set_pause))
        .route(
            "/api/searches",
            get(list_searches).post(record_search).put(update_search),
        )
        .route("/api/searches/:id", axum::routing::delete(delete_search))
        .route("/api/analysis", get(get_analysis))
        .route("/events", get(sse::events))
        .with_state(state)
}

fn not_found(what: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{} not found", what) })),
    )
}

/// Minimal landing page; the real UI bundle ships separately.
async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>breakout-proxy</title></head>\
         <body><h1>breakout-proxy</h1>\
         <p>Forward proxy with live capture inspection.</p>\
         <ul>\
         <li><a href=\"/api/captures\">/api/captures</a></li>\
         <li><a href=\"/api/data\">/api/data</a></li>\
         <li><a href=\"/events\">/events</a> (SSE)</li>\
         </ul></body></html>",
    )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// Optional filter query; non-empty values are remembered in the
    /// search history
    q: Option<String>,
}

async fn list_captures(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Capture>> {
    let captures = state.store.list();
    match query.q.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => {
            state.searches.record_use(q);
            let filter = Filter::parse(q);
            Json(
                captures
                    .into_iter()
                    .filter(|c| filter.matches(c))
                    .collect(),
            )
        }
        _ => Json(captures),
    }
}

async fn clear_captures(State(state): State<AppState>) -> StatusCode {
    state.store.clear();
    state.broker.publish(&Capture::control("cleared"));
    tracing::info!("All captures cleared");
    StatusCode::NO_CONTENT
}

async fn get_capture(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Capture>, (StatusCode, Json<serde_json::Value>)> {
    state
        .store
        .get(id)
        .map(Json)
        .ok_or_else(|| not_found("capture"))
}

async fn delete_capture(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    if !state.store.delete(id) {
        return Err(not_found("capture"));
    }
    state.broker.publish(&Capture::tombstone(id));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    name: String,
}

async fn rename_capture(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(payload): Json<RenamePayload>,
) -> Result<Json<Capture>, (StatusCode, Json<serde_json::Value>)> {
    let updated = state
        .store
        .update_name(id, &payload.name)
        .ok_or_else(|| not_found("capture"))?;
    state.broker.publish(&updated);
    Ok(Json(updated))
}

async fn get_data(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "captures": state.store.list(),
        "color_rules": state.rules.get_all(),
    }))
}

async fn get_rules(State(state): State<AppState>) -> Json<Vec<ColorRule>> {
    Json(state.rules.get_all())
}

/// Replace the ruleset wholesale. The server re-sorts by priority and
/// assigns ids the client left at zero.
async fn put_rules(
    State(state): State<AppState>,
    Json(rules): Json<Vec<ColorRule>>,
) -> Json<Vec<ColorRule>> {
    state.rules.replace(rules);
    Json(state.rules.get_all())
}

async fn get_pause(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "paused": state.paused.load(Ordering::Relaxed) }))
}

#[derive(Debug, Deserialize)]
struct PausePayload {
    paused: bool,
}

async fn set_pause(
    State(state): State<AppState>,
    Json(payload): Json<PausePayload>,
) -> Json<serde_json::Value> {
    state.paused.store(payload.paused, Ordering::SeqCst);
    let note = if payload.paused { "paused" } else { "resumed" };
    state.broker.publish(&Capture::control(note));
    tracing::info!("Recording {}", note);
    Json(json!({ "paused": payload.paused }))
}

async fn list_searches(State(state): State<AppState>) -> Json<Vec<SearchHistoryItem>> {
    Json(state.searches.list())
}

#[derive(Debug, Deserialize)]
struct RecordSearchPayload {
    query: String,
    label: Option<String>,
}

async fn record_search(
    State(state): State<AppState>,
    Json(payload): Json<RecordSearchPayload>,
) -> Result<Json<SearchHistoryItem>, (StatusCode, Json<serde_json::Value>)> {
    let item = state.searches.record_use(&payload.query).ok_or((
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "query must not be empty" })),
    ))?;
    let item = match payload.label {
        Some(label) => state
            .searches
            .update(item.id, Some(label), None)
            .unwrap_or(item),
        None => item,
    };
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct UpdateSearchPayload {
    id: u64,
    label: Option<String>,
    pinned: Option<bool>,
}

async fn update_search(
    State(state): State<AppState>,
    Json(payload): Json<UpdateSearchPayload>,
) -> Result<Json<SearchHistoryItem>, (StatusCode, Json<serde_json::Value>)> {
    state
        .searches
        .update(payload.id, payload.label, payload.pinned)
        .map(Json)
        .ok_or_else(|| not_found("search"))
}

async fn delete_search(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    if state.searches.delete(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("search"))
    }
}

async fn get_analysis(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.sink.snapshots())
}
