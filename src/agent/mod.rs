//! Agent Core
//!
//! The reason-act loop, the incremental invocation parser feeding it,
//! and the typed events it emits to clients.

pub mod engine;
pub mod events;
pub mod parser;

pub use engine::{
    AbortHandle, AgentEngine, CompletionRequest, EngineConfig, EngineState, RunOutcome,
};
pub use events::{AgentEvent, AgentEventKind, RunSummary};
pub use parser::{InvocationParser, ParseEvent};
