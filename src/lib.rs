//! Skillbot Agent Server
//!
//! An LLM agent runtime built around a skill orchestration core:
//! skills are external services described by SKILL.md manifests on
//! disk, discovered into an atomically-refreshable registry, and
//! invoked by the model through an isolated sandbox service.
//!
//! # Architecture
//!
//! ```text
//! Client ──► HTTP/SSE API ──► Agent Engine ──► LLM (streaming)
//!                                  │
//!                                  ├── Invocation Parser (stream tags)
//!                                  ├── Skill Registry (SKILL.md snapshots)
//!                                  ├── Skill Executor ──► Sandbox service
//!                                  ├── Prompt Composer (date + catalog + memory)
//!                                  ├── Memory (rerank + LLM extraction)
//!                                  └── Session Store (SQLite)
//! ```
//!
//! The engine drives a bounded reason-act loop: stream a model
//! response, execute any `<execute_skill>` blocks through the
//! sandbox, feed observations back, and repeat until the model
//! answers in plain text or the iteration bound forces a final pass.

pub mod agent;
pub mod api;
pub mod config;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod sandbox;
pub mod skills;
pub mod store;

pub use agent::{
    AbortHandle, AgentEngine, AgentEvent, AgentEventKind, CompletionRequest, EngineConfig,
    EngineState, RunOutcome, RunSummary,
};
pub use config::Config;
pub use llm::{ChatBackend, ChatMessage, ChatRequest, LlmError, OpenAiClient};
pub use memory::{MemoryConfig, MemoryRetriever, RerankClient, Reranker};
pub use sandbox::{CodeRunner, ExecuteRequest, ExecuteResult, SandboxClient, SandboxError};
pub use skills::{
    InvocationPayload, InvocationRequest, ManifestError, Observation, RegistryError,
    RegistrySnapshot, SkillExecutor, SkillManifest, SkillRegistry,
};
pub use store::{MemoryEntry, MessageRole, Session, SessionStore, StoreError, StoredMessage};
