//! Session & Message API
//!
//! CRUD over sessions and their chronological message history.

use super::{store_error, AppState};
use crate::store::{CreateSession, Session, SessionPatch, StoredMessage};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionBody {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub include_archived: bool,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<StoredMessage>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageQuery {
    #[serde(default)]
    pub include_following: bool,
}

/// POST /agent/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let data = CreateSession {
        title: body.title,
        model: body.model.unwrap_or_else(|| state.config.llm_model.clone()),
        system_prompt: body.system_prompt,
        temperature: body
            .temperature
            .unwrap_or(state.config.default_temperature as f64),
        max_tokens: body
            .max_tokens
            .unwrap_or(state.config.default_max_tokens as i64),
    };
    match state.store.create_session(data) {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /agent/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Response {
    let page_size = query.page_size.clamp(1, 100);
    match state
        .store
        .list_sessions(query.page, page_size, query.include_archived)
    {
        Ok((sessions, total)) => Json(SessionListResponse {
            sessions,
            total,
            page: query.page.max(1),
            page_size,
        })
        .into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /agent/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_session(&id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /agent/sessions/{id}
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> Response {
    match state.store.update_session(&id, patch) {
        Ok(session) => Json(session).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /agent/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.delete_session(&id) {
        Ok(()) => Json(serde_json::json!({ "status": "deleted", "session_id": id }))
            .into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /agent/sessions/{id}/messages
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    match state.store.messages(&id, query.limit) {
        Ok(messages) => {
            let total = messages.len();
            Json(MessageListResponse { messages, total }).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// DELETE /agent/sessions/{id}/messages
pub async fn clear_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.clear_messages(&id) {
        Ok(cleared) => Json(serde_json::json!({
            "status": "cleared",
            "session_id": id,
            "deleted": cleared,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /agent/sessions/{id}/messages/{mid}?include_following=
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((id, mid)): Path<(String, String)>,
    Query(query): Query<DeleteMessageQuery>,
) -> Response {
    match state
        .store
        .delete_message(&id, &mid, query.include_following)
    {
        Ok(deleted) => Json(serde_json::json!({
            "status": "deleted",
            "session_id": id,
            "message_id": mid,
            "deleted": deleted,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}
