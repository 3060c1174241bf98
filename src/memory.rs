//! Contextual Memory Retrieval
//!
//! Two-stage retrieval over the current session's history: an
//! external reranker scores prior messages against the new utterance,
//! then the LLM distills the survivors into a short excerpt the
//! prompt composer injects. Retrieval is gated on the number of user
//! turns; short conversations fit in the transcript as-is.

use crate::llm::{ChatBackend, ChatMessage, ChatRequest, LlmError};
use crate::store::{MessageRole, SessionStore};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many recent messages are considered as rerank candidates
const CANDIDATE_WINDOW: u32 = 50;

const EXTRACTION_INSTRUCTION: &str = "\
You distill conversation history. From the numbered excerpts below, \
extract only facts, preferences, and context the assistant should \
carry into its next reply to the user's new message. Answer as a \
short bullet list, no commentary. If nothing is relevant, answer \
with the single word: none.";

/// One scored candidate from the reranker
#[derive(Debug, Clone, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    #[serde(rename = "relevance_score")]
    pub score: f32,
}

/// Reranker seam, mockable in tests
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> anyhow::Result<Vec<RerankHit>>;
}

/// HTTP client for the rerank service (`POST /v1/rerank`)
pub struct RerankClient {
    http: reqwest::Client,
    base_url: String,
    model: Option<String>,
}

impl RerankClient {
    pub fn new(base_url: impl Into<String>, model: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl Reranker for RerankClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> anyhow::Result<Vec<RerankHit>> {
        #[derive(Deserialize)]
        struct RerankResponse {
            results: Vec<RerankHit>,
        }

        let mut payload = serde_json::json!({
            "query": query,
            "documents": documents,
            "top_n": top_n,
            "return_documents": false,
        });
        if let Some(model) = &self.model {
            payload["model"] = serde_json::json!(model);
        }

        let response = self
            .http
            .post(format!("{}/v1/rerank", self.base_url))
            .json(&payload)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;

        let parsed: RerankResponse = response.json().await?;
        Ok(parsed.results)
    }
}

/// Retrieval tuning knobs
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub top_k: usize,
    pub score_floor: f32,
    pub min_user_turns: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            score_floor: 0.3,
            min_user_turns: 4,
        }
    }
}

/// Two-stage retriever over one session's stored messages
pub struct MemoryRetriever {
    reranker: Arc<dyn Reranker>,
    llm: Arc<dyn ChatBackend>,
    llm_model: String,
    config: MemoryConfig,
}

impl MemoryRetriever {
    pub fn new(
        reranker: Arc<dyn Reranker>,
        llm: Arc<dyn ChatBackend>,
        llm_model: impl Into<String>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            reranker,
            llm,
            llm_model: llm_model.into(),
            config,
        }
    }

    /// Build the retrieval excerpt for the current utterance, or None
    /// when the gate is closed, nothing scores high enough, or a
    /// stage fails (failures degrade, they never abort the request).
    pub async fn excerpt(
        &self,
        store: &SessionStore,
        session_id: &str,
        utterance: &str,
    ) -> Option<String> {
        let user_turns = match store.user_message_count(session_id) {
            Ok(n) => n,
            Err(e) => {
                warn!("Memory gate check failed for {}: {}", session_id, e);
                return None;
            }
        };
        if user_turns < self.config.min_user_turns {
            debug!(
                "Memory retrieval skipped: {} user turns < {}",
                user_turns, self.config.min_user_turns
            );
            return None;
        }

        match self.retrieve(store, session_id, utterance).await {
            Ok(excerpt) => excerpt,
            Err(e) => {
                warn!("Memory retrieval failed for {}: {}", session_id, e);
                None
            }
        }
    }

    async fn retrieve(
        &self,
        store: &SessionStore,
        session_id: &str,
        utterance: &str,
    ) -> anyhow::Result<Option<String>> {
        // Stage 1: candidate selection over prior user/assistant
        // messages, excluding the utterance itself.
        let candidates: Vec<String> = store
            .messages(session_id, Some(CANDIDATE_WINDOW))?
            .into_iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .filter(|m| !(m.role == MessageRole::User && m.content == utterance))
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let hits = self
            .reranker
            .rerank(utterance, &candidates, self.config.top_k)
            .await?;
        let selected: Vec<&str> = hits
            .iter()
            .filter(|h| h.score >= self.config.score_floor)
            .take(self.config.top_k)
            .filter_map(|h| candidates.get(h.index).map(String::as_str))
            .collect();
        if selected.is_empty() {
            debug!("Memory retrieval: no candidate above score floor");
            return Ok(None);
        }

        // Stage 2: knowledge extraction.
        let mut user_prompt = String::from("Conversation excerpts:\n");
        for (i, text) in selected.iter().enumerate() {
            user_prompt.push_str(&format!("{}. {}\n", i + 1, truncate(text, 500)));
        }
        user_prompt.push_str(&format!("\nNew user message: {}", utterance));

        let excerpt = self
            .llm
            .chat(ChatRequest {
                messages: vec![
                    ChatMessage::system(EXTRACTION_INSTRUCTION),
                    ChatMessage::user(user_prompt),
                ],
                model: self.llm_model.clone(),
                temperature: 0.2,
                max_tokens: 512,
            })
            .await
            .map_err(|e: LlmError| anyhow::anyhow!(e))?;

        let excerpt = excerpt.trim().to_string();
        if excerpt.is_empty() || excerpt.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        Ok(Some(excerpt))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}
