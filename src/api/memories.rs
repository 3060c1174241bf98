//! Memory API
//!
//! Per-session key-value memory entries that are unconditionally
//! overlaid onto the prompt's memory section.

use super::{store_error, AppState};
use crate::store::MemoryEntry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SetMemoryBody {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default = "default_category")]
    pub category: String,
    /// Time to live in seconds
    pub ttl: Option<i64>,
}

fn default_category() -> String {
    "fact".to_string()
}

#[derive(Debug, Serialize)]
pub struct MemoryListResponse {
    pub memories: Vec<MemoryEntry>,
    pub total: usize,
}

/// GET /agent/sessions/{id}/memories
pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.list_memories(&id) {
        Ok(memories) => {
            let total = memories.len();
            Json(MemoryListResponse { memories, total }).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// POST /agent/sessions/{id}/memories
pub async fn set_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetMemoryBody>,
) -> Response {
    match state
        .store
        .set_memory(&id, &body.key, body.value, &body.category, body.ttl)
    {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /agent/sessions/{id}/memories/{key}
pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    match state.store.get_memory(&id, &key) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /agent/sessions/{id}/memories/{key}
pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    match state.store.delete_memory(&id, &key) {
        Ok(()) => Json(serde_json::json!({ "status": "deleted", "key": key })).into_response(),
        Err(e) => store_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{request_json, test_app};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_memory_crud() {
        let app = test_app();
        let (_, session) = request_json(
            &app,
            "POST",
            "/agent/sessions",
            Some(serde_json::json!({})),
        )
        .await;
        let id = session["id"].as_str().unwrap().to_string();
        let base = format!("/agent/sessions/{}/memories", id);

        let (status, entry) = request_json(
            &app,
            "POST",
            &base,
            Some(serde_json::json!({
                "key": "favorite_color",
                "value": "blue",
                "category": "preference",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["key"], "favorite_color");

        let (status, listed) = request_json(&app, "GET", &base, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["total"], 1);

        let (status, fetched) =
            request_json(&app, "GET", &format!("{}/favorite_color", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["value"], "blue");

        let (status, _) =
            request_json(&app, "DELETE", &format!("{}/favorite_color", base), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            request_json(&app, "GET", &format!("{}/favorite_color", base), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_memory_on_unknown_session() {
        let app = test_app();
        let (status, _) = request_json(
            &app,
            "POST",
            "/agent/sessions/nope/memories",
            Some(serde_json::json!({ "key": "k", "value": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
