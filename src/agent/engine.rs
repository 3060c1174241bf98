//! Agent Engine
//!
//! Drives the bounded reason-act loop for one request: stream from
//! the LLM, detect skill invocations in the stream, dispatch them
//! through the executor, feed observations back into the transcript,
//! and repeat until the model answers in plain text or the iteration
//! bound forces a final pass. Every step is surfaced as a typed event.

use super::events::{AgentEvent, RunSummary};
use super::parser::{InvocationParser, ParseEvent};
use crate::config::Config;
use crate::llm::{estimate_tokens, ChatBackend, ChatMessage, ChatRequest};
use crate::memory::MemoryRetriever;
use crate::prompt::{compose_system_prompt, PromptInputs};
use crate::skills::{InvocationPayload, RegistrySnapshot, SkillExecutor, SkillRegistry};
use crate::store::{CreateSession, MessageRole, NewMessage, Session, SessionPatch, SessionStore};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Directive injected before the forced final pass
const FORCED_FINAL_DIRECTIVE: &str = "\
The skill invocation limit for this request has been reached. Produce \
your final answer now from the information already gathered. Do not \
emit any further <execute_skill> or <read_skill> blocks.";

/// Cooperative cancellation handle checked at every suspension point
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the handle is aborted
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-request state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Starting,
    Composing,
    Streaming,
    Dispatching,
    Observing,
    Answering,
    Done,
    Aborted,
    Failed,
}

/// Engine-level defaults, resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm_model.clone(),
            temperature: config.default_temperature,
            max_tokens: config.default_max_tokens,
            max_iterations: config.max_iterations,
            tool_timeout_secs: config.tool_timeout_secs,
        }
    }
}

/// One completion request resolved by the API layer
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: Option<u32>,
    pub skip_save_user_message: bool,
    pub system_prompt: Option<String>,
}

/// Final accounting for one request
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub session_id: Option<String>,
    pub content: String,
    pub skills_used: Vec<String>,
    pub iterations: u32,
    pub state: EngineState,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// The reason-act loop driver
pub struct AgentEngine {
    llm: Arc<dyn ChatBackend>,
    executor: SkillExecutor,
    registry: Arc<SkillRegistry>,
    store: Arc<SessionStore>,
    memory: Arc<MemoryRetriever>,
    config: EngineConfig,
}

/// Why a run stopped before reaching `done`
enum Stop {
    /// Event receiver went away; treated like a cancellation
    Disconnected,
    Aborted,
    /// A terminal `error` event was already emitted
    Failed,
}

/// Results gathered during one streaming pass, used to extend the
/// transcript before the next pass
enum PassResult {
    Skill { name: String, text: String },
    Doc { name: String, text: String },
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn ChatBackend>,
        executor: SkillExecutor,
        registry: Arc<SkillRegistry>,
        store: Arc<SessionStore>,
        memory: Arc<MemoryRetriever>,
        config: EngineConfig,
    ) -> Self {
        Self {
            llm,
            executor,
            registry,
            store,
            memory,
            config,
        }
    }

    /// Execute one request, sending events into `tx`. The engine owns
    /// the whole lifecycle: session resolution, persistence, the
    /// iteration loop, and terminal events.
    pub async fn run(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<AgentEvent>,
        abort: AbortHandle,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        let (session, created_now) = match self.resolve_session(&request) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send(AgentEvent::error(e.to_string())).await;
                outcome.state = EngineState::Failed;
                return outcome;
            }
        };
        outcome.session_id = Some(session.id.clone());
        info!("Agent run starting for session {}", session.id);

        // Prior history is loaded before the new user message lands
        // so the transcript never contains it twice.
        let history = match self.store.messages(&session.id, None) {
            Ok(h) => h,
            Err(e) => {
                let _ = tx.send(AgentEvent::error(e.to_string())).await;
                outcome.state = EngineState::Failed;
                return outcome;
            }
        };

        if !request.skip_save_user_message {
            if let Err(e) = self
                .store
                .append_message(&session.id, NewMessage::new(MessageRole::User, &request.message))
            {
                let _ = tx.send(AgentEvent::error(e.to_string())).await;
                outcome.state = EngineState::Failed;
                return outcome;
            }
        }

        let mut run = Run {
            engine: self,
            tx,
            abort,
            session: session.clone(),
            snapshot: self.registry.snapshot(),
            request,
            history,
            state: EngineState::Starting,
            started: Instant::now(),
            transcript: Vec::new(),
            system_prompt: String::new(),
            full_answer: String::new(),
            any_delta: false,
            skills_used: Vec::new(),
            steps: Vec::new(),
            invocations: 0,
            forced_final: false,
            pass_results: Vec::new(),
        };

        let state = run.execute().await;

        if state == EngineState::Done && created_now && !run.full_answer.trim().is_empty() {
            self.spawn_title_generation(session.id.clone(), run.request.message.clone());
        }

        outcome.state = state;
        outcome.content = run.full_answer;
        outcome.skills_used = run.skills_used;
        outcome.iterations = run.invocations;
        outcome.prompt_tokens = estimate_tokens(&run.system_prompt)
            + run
                .transcript
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>();
        outcome.completion_tokens = estimate_tokens(&outcome.content);
        outcome
    }

    fn resolve_session(
        &self,
        request: &CompletionRequest,
    ) -> Result<(Session, bool), crate::store::StoreError> {
        match &request.session_id {
            Some(id) => Ok((self.store.get_session(id)?, false)),
            None => {
                let session = self.store.create_session(CreateSession {
                    title: None,
                    model: request.model.clone().unwrap_or_else(|| self.config.model.clone()),
                    system_prompt: None,
                    temperature: request.temperature.unwrap_or(self.config.temperature) as f64,
                    max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens) as i64,
                })?;
                Ok((session, true))
            }
        }
    }

    /// Best-effort background title for brand-new sessions
    fn spawn_title_generation(&self, session_id: String, user_message: String) {
        let llm = self.llm.clone();
        let store = self.store.clone();
        let model = self.config.model.clone();
        tokio::spawn(async move {
            let opening: String = user_message.chars().take(200).collect();
            let prompt = format!(
                "Write a short title (at most eight words) for a conversation that \
                 starts with:\n\n{}\n\nReturn only the title text, no markdown.",
                opening
            );
            let reply = llm
                .chat(ChatRequest {
                    messages: vec![ChatMessage::user(prompt)],
                    model,
                    temperature: 0.7,
                    max_tokens: 50,
                })
                .await;
            match reply {
                Ok(raw) => {
                    let title = clean_title(&raw);
                    if title.is_empty() {
                        return;
                    }
                    let patch = SessionPatch {
                        title: Some(title.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = store.update_session(&session_id, patch) {
                        warn!("Failed to store session title: {}", e);
                    } else {
                        info!("Generated title for session {}: {}", session_id, title);
                    }
                }
                Err(e) => debug!("Title generation failed: {}", e),
            }
        });
    }
}

struct Run<'a> {
    engine: &'a AgentEngine,
    tx: mpsc::Sender<AgentEvent>,
    abort: AbortHandle,
    session: Session,
    snapshot: Arc<RegistrySnapshot>,
    request: CompletionRequest,
    history: Vec<crate::store::StoredMessage>,
    state: EngineState,
    started: Instant,
    transcript: Vec<ChatMessage>,
    system_prompt: String,
    full_answer: String,
    any_delta: bool,
    skills_used: Vec<String>,
    steps: Vec<serde_json::Value>,
    invocations: u32,
    forced_final: bool,
    pass_results: Vec<PassResult>,
}

impl Run<'_> {
    async fn execute(&mut self) -> EngineState {
        self.state = EngineState::Composing;
        self.compose().await;

        let model = self
            .request
            .model
            .clone()
            .unwrap_or_else(|| self.session.model.clone());
        let temperature = self
            .request
            .temperature
            .unwrap_or(self.session.temperature as f32);
        let max_tokens = self
            .request
            .max_tokens
            .unwrap_or(self.session.max_tokens as u32);
        let max_iterations = self
            .request
            .max_iterations
            .unwrap_or(self.engine.config.max_iterations)
            .max(1);

        let mut pass = 0u32;
        loop {
            pass += 1;
            self.state = EngineState::Streaming;
            debug!(
                "Session {} pass {} (invocations {}/{})",
                self.session.id, pass, self.invocations, max_iterations
            );
            if self
                .emit(AgentEvent::thinking(format!("Analyzing (pass {})", pass)))
                .await
                .is_err()
            {
                return self.finish_interrupted();
            }

            let chat_request = ChatRequest {
                messages: self.chat_messages(),
                model: model.clone(),
                temperature,
                max_tokens,
            };

            let mut rx = match self.engine.llm.stream_chat(chat_request).await {
                Ok(rx) => rx,
                Err(e) => return self.finish_stream_error(e.to_string()).await,
            };

            let mut parser = InvocationParser::new();
            let mut pass_text = String::new();

            loop {
                let delta = tokio::select! {
                    _ = self.abort.cancelled() => return self.finish_interrupted(),
                    delta = rx.recv() => delta,
                };
                let Some(delta) = delta else { break };
                let chunk = match delta {
                    Ok(c) => c,
                    Err(e) => return self.finish_stream_error(e.to_string()).await,
                };
                self.any_delta = true;
                pass_text.push_str(&chunk);
                for event in parser.push(&chunk) {
                    match self.handle_parse_event(event, max_iterations).await {
                        Ok(()) => {}
                        Err(stop) => return self.finish_stopped(stop),
                    }
                }
            }
            for event in parser.finish() {
                match self.handle_parse_event(event, max_iterations).await {
                    Ok(()) => {}
                    Err(stop) => return self.finish_stopped(stop),
                }
            }

            if self.pass_results.is_empty() {
                break;
            }

            // Extend the transcript with this pass and its results,
            // then go around again.
            self.transcript.push(ChatMessage::assistant(pass_text));
            let results_prompt = self.results_prompt();
            self.transcript.push(ChatMessage::user(results_prompt));
            self.pass_results.clear();

            if self.invocations >= max_iterations && !self.forced_final {
                self.forced_final = true;
                warn!(
                    "Session {} hit the iteration bound ({}), forcing final pass",
                    self.session.id, max_iterations
                );
                self.transcript
                    .push(ChatMessage::system(FORCED_FINAL_DIRECTIVE));
            }
        }

        self.finish_done().await
    }

    async fn compose(&mut self) {
        if let Some(custom) = self
            .request
            .system_prompt
            .clone()
            .or_else(|| self.session.system_prompt.clone())
        {
            self.system_prompt = custom;
        } else {
            let memory_entries = self
                .engine
                .store
                .list_memories(&self.session.id)
                .unwrap_or_else(|e| {
                    warn!("Failed to load memories: {}", e);
                    Vec::new()
                });
            let memory_excerpt = self
                .engine
                .memory
                .excerpt(&self.engine.store, &self.session.id, &self.request.message)
                .await;
            self.system_prompt = compose_system_prompt(&PromptInputs {
                now: chrono::Utc::now(),
                skills_catalog: &self.snapshot.summarize_for_prompt(),
                memory_entries: &memory_entries,
                memory_excerpt: memory_excerpt.as_deref(),
            });
        }

        for message in &self.history {
            match message.role {
                MessageRole::User => self.transcript.push(ChatMessage::user(&message.content)),
                MessageRole::Assistant => {
                    self.transcript.push(ChatMessage::assistant(&message.content))
                }
                MessageRole::Tool => self.transcript.push(ChatMessage::user(format!(
                    "[Skill result: {}]\n{}",
                    message.skill_name.as_deref().unwrap_or("unknown"),
                    message.content
                ))),
                // Per-session overrides live on the session row, not
                // in the message history.
                MessageRole::System => {}
            }
        }
        self.transcript
            .push(ChatMessage::user(&self.request.message));
    }

    fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.transcript.len() + 1);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(self.transcript.iter().cloned());
        messages
    }

    async fn handle_parse_event(
        &mut self,
        event: ParseEvent,
        max_iterations: u32,
    ) -> Result<(), Stop> {
        match event {
            ParseEvent::Text(text) => {
                self.full_answer.push_str(&text);
                self.emit(AgentEvent::answer(text)).await?;
            }
            ParseEvent::Malformed { raw } => {
                self.emit(AgentEvent::warning(
                    "Ignoring malformed skill invocation block",
                ))
                .await?;
                // The raw block is echoed back as plain text.
                self.full_answer.push_str(&raw);
                self.emit(AgentEvent::answer(raw)).await?;
            }
            ParseEvent::ReadSkill(name) => {
                if self.forced_final || self.invocations >= max_iterations {
                    self.emit(AgentEvent::warning(format!(
                        "Documentation request for `{}` suppressed: iteration limit reached",
                        name
                    )))
                    .await?;
                    return Ok(());
                }
                self.emit(AgentEvent::skill_call(
                    &name,
                    format!("Reading documentation for skill: {}", name),
                    None,
                ))
                .await?;

                let text = match self.snapshot.get(&name) {
                    Ok(manifest) => manifest.body.clone(),
                    Err(e) => e.to_string(),
                };
                self.persist_tool_message(&name, &text, "read_skill", serde_json::json!({}))
                    .await?;
                self.steps.push(serde_json::json!({
                    "type": "read_skill",
                    "skillName": name.clone(),
                }));
                self.pass_results.push(PassResult::Doc { name, text });
                self.invocations += 1;
            }
            ParseEvent::Invocation(invocation) => {
                if self.forced_final || self.invocations >= max_iterations {
                    self.emit(AgentEvent::warning(format!(
                        "Skill invocation `{}` suppressed: iteration limit reached",
                        invocation.skill_name
                    )))
                    .await?;
                    return Ok(());
                }

                let name = invocation.skill_name.clone();
                self.emit(AgentEvent::skill_call(
                    &name,
                    format!("Invoking skill: {}", name),
                    Some(invocation.preview()),
                ))
                .await?;
                if let InvocationPayload::Code(code) = &invocation.payload {
                    self.emit(AgentEvent::code_execute(&name, code.clone())).await?;
                }

                self.state = EngineState::Dispatching;
                let observation = tokio::select! {
                    _ = self.abort.cancelled() => return Err(Stop::Aborted),
                    obs = self.engine.executor.execute(
                        &self.snapshot,
                        &invocation,
                        Some(self.engine.config.tool_timeout_secs),
                    ) => obs,
                };

                self.state = EngineState::Observing;
                self.emit(AgentEvent::skill_result(observation.clone())).await?;
                if matches!(invocation.payload, InvocationPayload::Code(_)) {
                    self.emit(AgentEvent::code_result(&name, observation.raw.clone()))
                        .await?;
                }

                if !self.skills_used.contains(&name) {
                    self.skills_used.push(name.clone());
                }
                self.steps.push(serde_json::json!({
                    "type": "skill_call",
                    "skillName": name.clone(),
                    "code": invocation.preview(),
                    "success": observation.success,
                }));

                self.persist_tool_message(
                    &name,
                    &observation.text,
                    "skill_result",
                    observation.raw.clone(),
                )
                .await?;
                self.pass_results.push(PassResult::Skill {
                    name,
                    text: observation.text,
                });
                self.invocations += 1;
                self.state = EngineState::Streaming;
            }
        }
        Ok(())
    }

    async fn persist_tool_message(
        &mut self,
        skill_name: &str,
        content: &str,
        event_type: &str,
        extra: serde_json::Value,
    ) -> Result<(), Stop> {
        let message = NewMessage::new(MessageRole::Tool, content)
            .with_skill(skill_name)
            .with_event_type(event_type)
            .with_extra(extra);
        if let Err(e) = self.engine.store.append_message(&self.session.id, message) {
            let _ = self.tx.send(AgentEvent::error(e.to_string())).await;
            return Err(Stop::Failed);
        }
        Ok(())
    }

    /// Follow-up prompt carrying this pass's results, in textual order
    fn results_prompt(&self) -> String {
        let mut lines = vec!["Here are the skill execution results:".to_string()];
        for (i, result) in self.pass_results.iter().enumerate() {
            match result {
                PassResult::Skill { name, text } => {
                    lines.push(format!("\n### Execution {}: {}", i + 1, name));
                    lines.push(format!("```\n{}\n```", cap(text, 2000)));
                }
                PassResult::Doc { name, text } => {
                    lines.push(format!("\n### Documentation: {}", i + 1));
                    lines.push(format!("## {} SKILL.md\n\n{}", name, cap(text, 4000)));
                }
            }
        }
        lines.push(
            "\nContinue based on these results. Call another skill if needed; \
             otherwise give your final answer."
                .to_string(),
        );
        lines.join("\n")
    }

    async fn finish_done(&mut self) -> EngineState {
        self.state = EngineState::Answering;

        if !self.full_answer.trim().is_empty() {
            let mut message =
                NewMessage::new(MessageRole::Assistant, self.full_answer.clone());
            if !self.steps.is_empty() {
                message = message
                    .with_extra(serde_json::json!({ "agentSteps": self.steps.clone() }));
            }
            if let Err(e) = self.engine.store.append_message(&self.session.id, message) {
                let _ = self.tx.send(AgentEvent::error(e.to_string())).await;
                self.state = EngineState::Failed;
                return self.state;
            }
        }

        let summary = RunSummary {
            iterations: self.invocations,
            skills_used: self.skills_used.clone(),
            execution_time: self.started.elapsed().as_secs_f64(),
        };
        let _ = self.tx.send(AgentEvent::done(summary)).await;
        info!(
            "Agent run done for session {} ({} invocations)",
            self.session.id, self.invocations
        );
        self.state = EngineState::Done;
        self.state
    }

    /// Stream failure: before any content the request simply fails;
    /// after partial content the partial answer is persisted first.
    async fn finish_stream_error(&mut self, error: String) -> EngineState {
        if self.any_delta {
            self.persist_partial();
        }
        let _ = self.tx.send(AgentEvent::error(error)).await;
        self.state = EngineState::Failed;
        self.state
    }

    /// Cancellation or client disconnect: no further events; partial
    /// answer text is persisted iff at least one delta arrived.
    fn finish_interrupted(&mut self) -> EngineState {
        if self.any_delta {
            self.persist_partial();
        }
        info!("Agent run aborted for session {}", self.session.id);
        self.state = EngineState::Aborted;
        self.state
    }

    fn finish_stopped(&mut self, stop: Stop) -> EngineState {
        match stop {
            Stop::Disconnected | Stop::Aborted => self.finish_interrupted(),
            Stop::Failed => {
                // The terminal error event was already emitted; any
                // streamed answer text still gets persisted.
                if self.any_delta {
                    self.persist_partial();
                }
                self.state = EngineState::Failed;
                self.state
            }
        }
    }

    fn persist_partial(&mut self) {
        if self.full_answer.trim().is_empty() {
            return;
        }
        let message = NewMessage::new(MessageRole::Assistant, self.full_answer.clone());
        if let Err(e) = self.engine.store.append_message(&self.session.id, message) {
            warn!("Failed to persist partial answer: {}", e);
        }
    }

    async fn emit(&self, event: AgentEvent) -> Result<(), Stop> {
        self.tx.send(event).await.map_err(|_| Stop::Disconnected)
    }
}

fn cap(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

static TITLE_MARKUP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^#+\s*)|(\*{1,2})|(_{1,2})|(`+)|[\[\]<>|~#]").unwrap());
static TITLE_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static TITLE_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip markdown noise from a model-produced title
fn clean_title(raw: &str) -> String {
    let title = TITLE_LINK_RE.replace_all(raw.trim(), "$1");
    let title = TITLE_MARKUP_RE.replace_all(&title, "");
    let title = TITLE_SPACE_RE.replace_all(&title, " ");
    let title = title.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    title.chars().take(50).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::memory::{MemoryConfig, MemoryRetriever, Reranker, RerankHit};
    use crate::sandbox::{CodeRunner, ExecuteRequest, ExecuteResult, SandboxError};
    use crate::skills::registry::MANIFEST_FILENAME;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Chat backend replaying one scripted delta list per call
    struct ScriptedChat {
        scripts: Mutex<Vec<ScriptedResponse>>,
    }

    enum ScriptedResponse {
        Deltas(Vec<&'static str>),
        /// Deltas followed by a stream error
        ErrorAfter(Vec<&'static str>),
        /// One delta, then the stream hangs until dropped
        Hang(&'static str),
    }

    impl ScriptedChat {
        fn new(scripts: Vec<ScriptedResponse>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        async fn chat(&self, _req: ChatRequest) -> Result<String, LlmError> {
            Ok("A short title".to_string())
        }

        async fn stream_chat(
            &self,
            _req: ChatRequest,
        ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    ScriptedResponse::Deltas(vec![])
                } else {
                    scripts.remove(0)
                }
            };
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                match script {
                    ScriptedResponse::Deltas(deltas) => {
                        for delta in deltas {
                            if tx.send(Ok(delta.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    ScriptedResponse::ErrorAfter(deltas) => {
                        for delta in deltas {
                            if tx.send(Ok(delta.to_string())).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx
                            .send(Err(LlmError::Stream("connection reset".into())))
                            .await;
                    }
                    ScriptedResponse::Hang(delta) => {
                        let _ = tx.send(Ok(delta.to_string())).await;
                        // Keep the sender alive until the receiver drops
                        tx.closed().await;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct MockRunner {
        results: Mutex<Vec<Result<ExecuteResult, SandboxError>>>,
        calls: Mutex<usize>,
    }

    impl MockRunner {
        fn returning(results: Vec<Result<ExecuteResult, SandboxError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CodeRunner for MockRunner {
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResult, SandboxError> {
            *self.calls.lock().unwrap() += 1;
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(ExecuteResult {
                    success: true,
                    stdout: "ok".into(),
                    ..Default::default()
                })
            } else {
                results.remove(0)
            }
        }
    }

    /// Runner that deletes the session while dispatching, so the
    /// tool-result write that follows the observation fails
    struct SabotageRunner {
        store: Arc<SessionStore>,
        session_id: Mutex<String>,
    }

    #[async_trait]
    impl CodeRunner for SabotageRunner {
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResult, SandboxError> {
            let id = self.session_id.lock().unwrap().clone();
            let _ = self.store.delete_session(&id);
            Ok(ExecuteResult {
                success: true,
                stdout: "RESULT".into(),
                ..Default::default()
            })
        }
    }

    struct NoopReranker;

    #[async_trait]
    impl Reranker for NoopReranker {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> anyhow::Result<Vec<RerankHit>> {
            Ok(vec![])
        }
    }

    struct Fixture {
        engine: AgentEngine,
        store: Arc<SessionStore>,
        runner: Arc<MockRunner>,
        _skills_dir: TempDir,
    }

    fn fixture(
        llm: Arc<ScriptedChat>,
        runner: Arc<MockRunner>,
        max_iterations: u32,
    ) -> Fixture {
        let skills_dir = TempDir::new().unwrap();
        let dir = skills_dir.path().join("websearch_service");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILENAME),
            "---\nname: websearch_service\ndescription: Search the web\nclient_class: WebSearchClient\ndefault_method: search\n---\nusage\n",
        )
        .unwrap();

        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let registry = Arc::new(SkillRegistry::new(
            SkillRegistry::build(skills_dir.path()).unwrap(),
        ));
        let memory = Arc::new(MemoryRetriever::new(
            Arc::new(NoopReranker),
            llm.clone(),
            "test-model",
            MemoryConfig::default(),
        ));
        let executor = SkillExecutor::new(runner.clone(), "sandbox_service", 60);
        let engine = AgentEngine::new(
            llm,
            executor,
            registry,
            store.clone(),
            memory,
            EngineConfig {
                model: "test-model".into(),
                temperature: 0.7,
                max_tokens: 1024,
                max_iterations,
                tool_timeout_secs: 5,
            },
        );
        Fixture {
            engine,
            store,
            runner,
            _skills_dir: skills_dir,
        }
    }

    fn session_for(fixture: &Fixture) -> String {
        fixture
            .store
            .create_session(CreateSession {
                title: None,
                model: "test-model".into(),
                system_prompt: None,
                temperature: 0.7,
                max_tokens: 1024,
            })
            .unwrap()
            .id
    }

    async fn run_collect(
        fixture: &Fixture,
        request: CompletionRequest,
    ) -> (RunOutcome, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let (outcome, events) = tokio::join!(
            fixture.engine.run(request, tx, AbortHandle::new()),
            async move {
                let mut events = Vec::new();
                while let Some(event) = rx.recv().await {
                    events.push(event);
                }
                events
            }
        );
        (outcome, events)
    }

    fn event_types(events: &[AgentEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                serde_json::to_value(e).unwrap()["event_type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    fn answers(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                super::super::events::AgentEventKind::Answer { content } => {
                    Some(content.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_no_skill_answer() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Deltas(vec!["Hi!"])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "Hello".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.content, "Hi!");
        assert_eq!(answers(&events), "Hi!");
        let types = event_types(&events);
        assert_eq!(types.last().unwrap(), "done");
        assert_eq!(types.iter().filter(|t| *t == "done").count(), 1);

        // User + assistant persisted, identical content and role
        let messages = fx.store.messages(&session_id, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Hi!");
    }

    #[tokio::test]
    async fn test_single_skill_call() {
        let llm = ScriptedChat::new(vec![
            ScriptedResponse::Deltas(vec![
                "<execute_skill>",
                "<skill_name>websearch_service</skill_name>",
                "<code>print('q')</code>",
                "</execute_skill>",
                "Done.",
            ]),
            ScriptedResponse::Deltas(vec![]),
        ]);
        let runner = MockRunner::returning(vec![Ok(ExecuteResult {
            success: true,
            stdout: "RESULT".into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 8,
        })]);
        let fx = fixture(llm, runner.clone(), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "search something".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.content, "Done.");
        assert_eq!(outcome.skills_used, vec!["websearch_service"]);
        assert_eq!(runner.calls(), 1);

        let types = event_types(&events);
        let call = types.iter().position(|t| t == "skill_call").unwrap();
        let result = types.iter().position(|t| t == "skill_result").unwrap();
        let answer = types.iter().position(|t| t == "answer").unwrap();
        assert!(call < result && result < answer);
        assert_eq!(types.last().unwrap(), "done");

        // Tool message persisted with the observation text
        let messages = fx.store.messages(&session_id, None).unwrap();
        let tool = messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool.content, "RESULT");
        assert_eq!(tool.skill_name.as_deref(), Some("websearch_service"));
        assert_eq!(messages.last().unwrap().content, "Done.");
    }

    #[tokio::test]
    async fn test_unknown_skill_keeps_loop_alive() {
        let llm = ScriptedChat::new(vec![
            ScriptedResponse::Deltas(vec![
                "<execute_skill><skill_name>mystery</skill_name><code>x</code></execute_skill>",
            ]),
            ScriptedResponse::Deltas(vec!["I could not find that skill."]),
        ]);
        let runner = MockRunner::returning(vec![]);
        let fx = fixture(llm, runner.clone(), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "use mystery".into(),
                session_id: Some(session_id),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.content, "I could not find that skill.");
        assert_eq!(runner.calls(), 0);

        let failure = events
            .iter()
            .find_map(|e| match &e.kind {
                super::super::events::AgentEventKind::SkillResult { result, .. } => {
                    Some(result.clone())
                }
                _ => None,
            })
            .unwrap();
        assert!(!failure.success);
        assert!(failure.text.contains("not found"));
        assert_eq!(event_types(&events).last().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_iteration_bound_forces_final_pass() {
        let llm = ScriptedChat::new(vec![
            ScriptedResponse::Deltas(vec![
                "<execute_skill><skill_name>websearch_service</skill_name><code>a()</code></execute_skill>",
            ]),
            // Forced final pass still tries to invoke
            ScriptedResponse::Deltas(vec![
                "<execute_skill><skill_name>websearch_service</skill_name><code>b()</code></execute_skill>",
                "Best effort answer.",
            ]),
        ]);
        let runner = MockRunner::returning(vec![Ok(ExecuteResult {
            success: true,
            stdout: "first".into(),
            ..Default::default()
        })]);
        let fx = fixture(llm, runner.clone(), 1);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "go".into(),
                session_id: Some(session_id),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.content, "Best effort answer.");
        // The bound held: exactly one sandbox call
        assert_eq!(runner.calls(), 1);
        assert_eq!(outcome.iterations, 1);

        let types = event_types(&events);
        assert_eq!(types.iter().filter(|t| *t == "skill_result").count(), 1);
        assert!(types.iter().any(|t| t == "warning"));
        assert_eq!(types.last().unwrap(), "done");
        assert_eq!(types.iter().filter(|t| *t == "done").count(), 1);
    }

    #[tokio::test]
    async fn test_two_invocations_in_one_response() {
        let llm = ScriptedChat::new(vec![
            ScriptedResponse::Deltas(vec![
                "<execute_skill><skill_name>websearch_service</skill_name><code>a()</code></execute_skill>",
                "<execute_skill><skill_name>websearch_service</skill_name><code>b()</code></execute_skill>",
            ]),
            ScriptedResponse::Deltas(vec!["Both done."]),
        ]);
        let runner = MockRunner::returning(vec![
            Ok(ExecuteResult {
                success: true,
                stdout: "one".into(),
                ..Default::default()
            }),
            Ok(ExecuteResult {
                success: true,
                stdout: "two".into(),
                ..Default::default()
            }),
        ]);
        let fx = fixture(llm, runner.clone(), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "go".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(runner.calls(), 2);
        assert_eq!(outcome.iterations, 2);

        // Executed in textual order
        let results: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.kind {
                super::super::events::AgentEventKind::SkillResult { result, .. } => {
                    Some(result.text.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(results, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_whitespace_only_response() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Deltas(vec!["  \n "])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "hm".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(event_types(&events).last().unwrap(), "done");
        // No empty assistant message persisted
        let messages = fx.store.messages(&session_id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Hang("partial answer")]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (tx, mut rx) = mpsc::channel(64);
        let abort = AbortHandle::new();
        let run_abort = abort.clone();
        let request = CompletionRequest {
            message: "hello".into(),
            session_id: Some(session_id.clone()),
            ..Default::default()
        };

        let run_task = tokio::spawn({
            let engine_fx = fx.engine.clone_for_test();
            async move { engine_fx.run(request, tx, run_abort).await }
        });

        // Wait for the first answer delta, then abort
        let mut saw_answer = false;
        while let Some(event) = rx.recv().await {
            if matches!(
                event.kind,
                super::super::events::AgentEventKind::Answer { .. }
            ) {
                saw_answer = true;
                abort.abort();
                break;
            }
        }
        assert!(saw_answer);

        let outcome = run_task.await.unwrap();
        assert_eq!(outcome.state, EngineState::Aborted);

        // No terminal event after the abort boundary
        let mut trailing = Vec::new();
        while let Some(event) = rx.recv().await {
            trailing.push(event);
        }
        assert!(trailing.iter().all(|e| !e.is_terminal()));

        // Partial assistant text was persisted
        let messages = fx.store.messages(&session_id, None).unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "partial answer");
    }

    #[tokio::test]
    async fn test_stream_error_before_content() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::ErrorAfter(vec![])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "hello".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Failed);
        let types = event_types(&events);
        assert_eq!(types.last().unwrap(), "error");
        assert_eq!(types.iter().filter(|t| *t == "error").count(), 1);
        // Only the user message exists
        assert_eq!(fx.store.messages(&session_id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_error_after_partial_content() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::ErrorAfter(vec!["part one "])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "hello".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Failed);
        assert_eq!(event_types(&events).last().unwrap(), "error");
        let messages = fx.store.messages(&session_id, None).unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "part one ");
    }

    #[tokio::test]
    async fn test_tool_persist_failure_keeps_streamed_text() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Deltas(vec![
            "Let me check.",
            "<execute_skill><skill_name>websearch_service</skill_name><code>x()</code></execute_skill>",
        ])]);

        let skills_dir = TempDir::new().unwrap();
        let dir = skills_dir.path().join("websearch_service");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILENAME),
            "---\nname: websearch_service\ndescription: Search the web\n---\nusage\n",
        )
        .unwrap();

        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let session_id = store
            .create_session(CreateSession {
                title: None,
                model: "test-model".into(),
                system_prompt: None,
                temperature: 0.7,
                max_tokens: 1024,
            })
            .unwrap()
            .id;
        let runner = Arc::new(SabotageRunner {
            store: store.clone(),
            session_id: Mutex::new(session_id.clone()),
        });

        let llm: Arc<dyn ChatBackend> = llm;
        let memory = Arc::new(MemoryRetriever::new(
            Arc::new(NoopReranker),
            llm.clone(),
            "test-model",
            MemoryConfig::default(),
        ));
        let engine = AgentEngine::new(
            llm,
            SkillExecutor::new(runner, "sandbox_service", 60),
            Arc::new(SkillRegistry::new(
                SkillRegistry::build(skills_dir.path()).unwrap(),
            )),
            store,
            memory,
            EngineConfig {
                model: "test-model".into(),
                temperature: 0.7,
                max_tokens: 1024,
                max_iterations: 10,
                tool_timeout_secs: 5,
            },
        );

        let (tx, mut rx) = mpsc::channel(256);
        let request = CompletionRequest {
            message: "search something".into(),
            session_id: Some(session_id),
            ..Default::default()
        };
        let (outcome, events) = tokio::join!(
            engine.run(request, tx, AbortHandle::new()),
            async move {
                let mut events = Vec::new();
                while let Some(event) = rx.recv().await {
                    events.push(event);
                }
                events
            }
        );

        // The tool-result write failed mid-pass: the streamed text
        // still reached the client and the run terminated with a
        // single error event.
        assert_eq!(outcome.state, EngineState::Failed);
        assert!(answers(&events).contains("Let me check."));
        let types = event_types(&events);
        assert!(types.iter().any(|t| t == "skill_result"));
        assert_eq!(types.last().unwrap(), "error");
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_block_warns_and_echoes() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Deltas(vec![
            "before ",
            "<execute_skill><skill_name>s</skill_name><code>never closed",
        ])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "hello".into(),
                session_id: Some(session_id),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        let types = event_types(&events);
        assert!(types.iter().any(|t| t == "warning"));
        assert!(outcome.content.starts_with("before "));
        assert!(outcome.content.contains("never closed"));
    }

    #[tokio::test]
    async fn test_skip_save_user_message() {
        let llm = ScriptedChat::new(vec![ScriptedResponse::Deltas(vec!["Sure."])]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        run_collect(
            &fx,
            CompletionRequest {
                message: "secret".into(),
                session_id: Some(session_id.clone()),
                skip_save_user_message: true,
                ..Default::default()
            },
        )
        .await;

        let messages = fx.store.messages(&session_id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_read_skill_feeds_documentation() {
        let llm = ScriptedChat::new(vec![
            ScriptedResponse::Deltas(vec!["<read_skill>websearch_service</read_skill>"]),
            ScriptedResponse::Deltas(vec!["The docs say: usage."]),
        ]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);
        let session_id = session_for(&fx);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "how does search work?".into(),
                session_id: Some(session_id.clone()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.content, "The docs say: usage.");
        assert!(event_types(&events).iter().any(|t| t == "skill_call"));

        // The documentation round was persisted as a tool message
        let messages = fx.store.messages(&session_id, None).unwrap();
        let tool = messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert_eq!(tool.event_type.as_deref(), Some("read_skill"));
        assert!(tool.content.contains("usage"));
    }

    #[tokio::test]
    async fn test_unknown_session_fails() {
        let llm = ScriptedChat::new(vec![]);
        let fx = fixture(llm, MockRunner::returning(vec![]), 10);

        let (outcome, events) = run_collect(
            &fx,
            CompletionRequest {
                message: "hello".into(),
                session_id: Some("no-such-session".into()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(outcome.state, EngineState::Failed);
        assert_eq!(event_types(&events), vec!["error"]);
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("# **My Title**"), "My Title");
        assert_eq!(clean_title("\"Quoted title\""), "Quoted title");
        assert_eq!(clean_title("[Link](http://x)"), "Link");
        assert_eq!(clean_title("a   b\nc"), "a b c");
    }

    impl AgentEngine {
        /// Cheap clone for tests that move the engine into a task
        fn clone_for_test(&self) -> Self {
            Self {
                llm: self.llm.clone(),
                executor: SkillExecutor::new(
                    Arc::new(NeverRunner),
                    "sandbox_service",
                    60,
                ),
                registry: self.registry.clone(),
                store: self.store.clone(),
                memory: self.memory.clone(),
                config: self.config.clone(),
            }
        }
    }

    struct NeverRunner;

    #[async_trait]
    impl CodeRunner for NeverRunner {
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResult, SandboxError> {
            panic!("sandbox must not be reached in this test");
        }
    }
}
