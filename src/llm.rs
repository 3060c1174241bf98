//! LLM Client
//!
//! OpenAI-compatible chat completions client with SSE streaming.
//! The engine talks to the backend through the `ChatBackend` trait so
//! tests can script responses without a network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Wire roles for the chat completions API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Parameters for one completion call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// LLM transport and protocol errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("llm returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("llm stream error: {0}")]
    Stream(String),
}

/// Chat completion backend seam
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Blocking completion, returns the full assistant text
    async fn chat(&self, req: ChatRequest) -> Result<String, LlmError>;

    /// Streaming completion. Each channel item is one content delta;
    /// the channel closes when the stream ends.
    async fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError>;
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible backend
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, body: &CompletionBody<'_>) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn chat(&self, req: ChatRequest) -> Result<String, LlmError> {
        debug!(
            "Chat completion: model={}, messages={}",
            req.model,
            req.messages.len()
        );
        let body = CompletionBody {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
        };

        let response = self.request(&body).send().await?;
        if !response.status().is_success() {
            return Err(LlmError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: CompletionResponse = response.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        use futures_util::StreamExt;

        debug!(
            "Stream chat completion: model={}, messages={}",
            req.model,
            req.messages.len()
        );
        let body = CompletionBody {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: true,
        };

        let response = self.request(&body).send().await?;
        if !response.status().is_success() {
            return Err(LlmError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(payload) {
                        Ok(chunk) => {
                            let delta = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta.content)
                                .unwrap_or_default();
                            if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Unparseable stream chunk: {}", e);
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Rough token estimate: CJK text runs ~1.5 chars/token, everything
/// else ~4 chars/token. Used only for usage reporting.
pub fn estimate_tokens(text: &str) -> usize {
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    let other = text.chars().count() - cjk;
    (cjk as f64 / 1.5 + other as f64 / 4.0) as usize
}
