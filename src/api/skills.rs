//! Skill Registry API
//!
//! Read access to the current snapshot plus a refresh trigger.

use super::{ApiError, AppState};
use crate::skills::{RegistryError, SkillManifest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
    pub executable: bool,
    pub related_tools: Vec<String>,
}

impl From<&SkillManifest> for SkillSummary {
    fn from(manifest: &SkillManifest) -> Self {
        Self {
            name: manifest.name.clone(),
            description: manifest.description.clone(),
            executable: manifest.executable,
            related_tools: manifest.related_tools.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SkillListResponse {
    pub skills: Vec<SkillSummary>,
    pub total: usize,
}

/// GET /agent/skills
pub async fn list_skills(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.registry.snapshot();
    let skills: Vec<SkillSummary> = snapshot.list().map(SkillSummary::from).collect();
    let total = skills.len();
    Json(SkillListResponse { skills, total }).into_response()
}

/// GET /agent/skills/{name}
pub async fn get_skill(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let snapshot = state.registry.snapshot();
    match snapshot.get(&name) {
        Ok(manifest) => Json(manifest.clone()).into_response(),
        Err(e) => ApiError::response(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// POST /agent/skills/refresh
pub async fn refresh_skills(State(state): State<Arc<AppState>>) -> Response {
    match state.registry.refresh() {
        Ok(count) => Json(serde_json::json!({
            "status": "refreshed",
            "skill_count": count,
        }))
        .into_response(),
        Err(e) => {
            warn!("Skill refresh failed, keeping prior snapshot: {}", e);
            let status = match e {
                RegistryError::DuplicateName { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            ApiError::response(status, e.to_string())
        }
    }
}
