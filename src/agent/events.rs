//! Agent Event Stream
//!
//! Typed events produced by the engine and consumed by the transport
//! layer. The wire format is a flat JSON object with an `event_type`
//! discriminant and a timestamp; exactly one `done` or `error`
//! terminates a stream.

use crate::skills::Observation;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One event in a request's ordered stream
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

/// Event payloads, tagged on the wire as `event_type`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AgentEventKind {
    /// Progress notice while the model reasons
    Thinking { content: String },
    /// A skill invocation was parsed from the response
    SkillCall {
        skill_name: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Observation returned by the executor
    SkillResult {
        skill_name: String,
        result: Observation,
    },
    /// Raw code forwarded to the sandbox
    CodeExecute { skill_name: String, code: String },
    /// Raw sandbox payload for a code execution
    CodeResult {
        skill_name: String,
        result: serde_json::Value,
    },
    /// Incremental final-answer text
    Answer { content: String },
    /// Recoverable anomaly (malformed block, suppressed invocation)
    Warning { content: String },
    /// Terminal failure
    Error { error: String },
    /// Terminal success
    Done { result: RunSummary },
}

/// Summary carried by the terminal `done` event
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub iterations: u32,
    pub skills_used: Vec<String>,
    pub execution_time: f64,
}

impl AgentEvent {
    pub fn new(kind: AgentEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(AgentEventKind::Thinking {
            content: content.into(),
        })
    }

    pub fn skill_call(
        skill_name: impl Into<String>,
        content: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::new(AgentEventKind::SkillCall {
            skill_name: skill_name.into(),
            content: content.into(),
            code,
        })
    }

    pub fn skill_result(result: Observation) -> Self {
        Self::new(AgentEventKind::SkillResult {
            skill_name: result.skill_name.clone(),
            result,
        })
    }

    pub fn code_execute(skill_name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(AgentEventKind::CodeExecute {
            skill_name: skill_name.into(),
            code: code.into(),
        })
    }

    pub fn code_result(skill_name: impl Into<String>, result: serde_json::Value) -> Self {
        Self::new(AgentEventKind::CodeResult {
            skill_name: skill_name.into(),
            result,
        })
    }

    pub fn answer(content: impl Into<String>) -> Self {
        Self::new(AgentEventKind::Answer {
            content: content.into(),
        })
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self::new(AgentEventKind::Warning {
            content: content.into(),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::new(AgentEventKind::Error {
            error: error.into(),
        })
    }

    pub fn done(result: RunSummary) -> Self {
        Self::new(AgentEventKind::Done { result })
    }

    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            AgentEventKind::Done { .. } | AgentEventKind::Error { .. }
        )
    }
}
