//! Completions API
//!
//! `POST /agent/completions` drives one engine run. With `stream`
//! (the default) events arrive as SSE `data:` lines terminated by
//! `[DONE]`; otherwise the full event list comes back in one JSON
//! object. Dropping the SSE connection cancels the run.

use super::{ApiError, AppState};
use crate::agent::{AbortHandle, AgentEvent, CompletionRequest, EngineState, RunOutcome};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub message: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub skip_save_user_message: bool,
    pub max_iterations: Option<u32>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub events: Vec<AgentEvent>,
    pub skills_used: Vec<String>,
    pub usage: Usage,
    pub created: i64,
}

/// POST /agent/completions
pub async fn agent_completion(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CompletionBody>,
) -> Response {
    if body.message.trim().is_empty() {
        return ApiError::response(StatusCode::BAD_REQUEST, "message must not be empty");
    }
    let images_ignored = !body.images.is_empty();

    let request = CompletionRequest {
        message: body.message,
        session_id: body.session_id,
        model: body.model,
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        max_iterations: body.max_iterations,
        skip_save_user_message: body.skip_save_user_message,
        system_prompt: body.system_prompt,
    };

    if body.stream {
        stream_completion(state, request, images_ignored)
    } else {
        json_completion(state, request, images_ignored).await
    }
}

fn stream_completion(
    state: Arc<AppState>,
    request: CompletionRequest,
    images_ignored: bool,
) -> Response {
    let (tx, rx) = mpsc::channel(64);
    let abort = AbortHandle::new();

    if images_ignored {
        let _ = tx.try_send(AgentEvent::warning(
            "image inputs are not supported and were ignored",
        ));
    }

    let engine = state.engine.clone();
    let run_abort = abort.clone();
    tokio::spawn(async move {
        engine.run(request, tx, run_abort).await;
    });

    let events = EventStream {
        inner: ReceiverStream::new(rx),
        _guard: AbortOnDrop(abort),
    };
    let sse = events
        .map(|event| {
            Ok::<_, Infallible>(
                Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
            )
        })
        .chain(stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Sse::new(sse)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

async fn json_completion(
    state: Arc<AppState>,
    request: CompletionRequest,
    images_ignored: bool,
) -> Response {
    let (tx, mut rx) = mpsc::channel(256);
    let engine = state.engine.clone();
    let handle = tokio::spawn(async move {
        engine.run(request, tx, AbortHandle::new()).await
    });

    let mut events = Vec::new();
    if images_ignored {
        events.push(AgentEvent::warning(
            "image inputs are not supported and were ignored",
        ));
    }
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let outcome: RunOutcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            return ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    };

    match outcome.state {
        EngineState::Done => {
            let usage = Usage {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
                total_tokens: outcome.prompt_tokens + outcome.completion_tokens,
            };
            Json(CompletionResponse {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: outcome.session_id.unwrap_or_default(),
                content: outcome.content,
                events,
                skills_used: outcome.skills_used,
                usage,
                created: chrono::Utc::now().timestamp(),
            })
            .into_response()
        }
        _ => {
            let error = events
                .iter()
                .rev()
                .find_map(|e| match &e.kind {
                    crate::agent::AgentEventKind::Error { error } => Some(error.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "agent run did not complete".to_string());
            ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
    }
}

/// Receiver-backed event stream that cancels the run when dropped
struct EventStream {
    inner: ReceiverStream<AgentEvent>,
    _guard: AbortOnDrop,
}

impl Stream for EventStream {
    type Item = AgentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
