//! HTTP surface: health, session listing, theme API, and the WebSocket
//! bridge endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::registry::SessionRegistry;
use crate::themes;
use crate::ws;

pub fn build_router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/themes", get(list_themes))
        .route("/api/themes/:name", get(get_theme))
        .route("/ws", get(ws::attach_new))
        .route("/ws/:session_id", get(ws::attach_existing))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct SessionRow {
    id: String,
    created: DateTime<Utc>,
    clients: usize,
    alive: bool,
}

async fn list_sessions(State(registry): State<Arc<SessionRegistry>>) -> Json<Vec<SessionRow>> {
    let rows = registry
        .list()
        .into_iter()
        .map(|info| SessionRow {
            id: info.id,
            created: info.created,
            clients: info.clients,
            alive: info.alive,
        })
        .collect();
    Json(rows)
}

async fn list_themes(State(registry): State<Arc<SessionRegistry>>) -> Json<serde_json::Value> {
    Json(json!({
        "themes": themes::names(),
        "current": registry.settings().theme,
    }))
}

async fn get_theme(Path(name): Path<String>) -> impl IntoResponse {
    match themes::get(&name) {
        Some(theme) => Json(theme).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown theme: {name}") })),
        )
            .into_response(),
    }
}
