//! HTTP API
//!
//! REST + SSE surface under `/agent`, mirroring the engine's
//! capabilities: completions, session and message management, memory
//! CRUD, and skill registry access.

pub mod completions;
pub mod memories;
pub mod sessions;
pub mod skills;

use crate::agent::AgentEngine;
use crate::config::Config;
use crate::skills::SkillRegistry;
use crate::store::{SessionStore, StoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub registry: Arc<SkillRegistry>,
    pub engine: Arc<AgentEngine>,
    pub config: Arc<Config>,
}

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/agent", agent_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn agent_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/completions", post(completions::agent_completion))
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/{id}",
            get(sessions::get_session)
                .put(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route(
            "/sessions/{id}/messages",
            get(sessions::get_messages).delete(sessions::clear_messages),
        )
        .route(
            "/sessions/{id}/messages/{mid}",
            axum::routing::delete(sessions::delete_message),
        )
        .route(
            "/sessions/{id}/memories",
            get(memories::list_memories).post(memories::set_memory),
        )
        .route(
            "/sessions/{id}/memories/{key}",
            get(memories::get_memory).delete(memories::delete_memory),
        )
        .route("/skills", get(skills::list_skills))
        .route("/skills/refresh", post(skills::refresh_skills))
        .route("/skills/{name}", get(skills::get_skill))
        .with_state(state)
}

/// Uniform error body
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn response(status: StatusCode, message: impl Into<String>) -> Response {
        (
            status,
            Json(ApiError {
                error: message.into(),
            }),
        )
            .into_response()
    }
}

/// Map store errors onto HTTP statuses
pub fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::SessionNotFound(_)
        | StoreError::MessageNotFound(_)
        | StoreError::MemoryNotFound(_) => {
            ApiError::response(StatusCode::NOT_FOUND, err.to_string())
        }
        StoreError::Db(_) => {
            ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
