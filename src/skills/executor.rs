//! Skill Executor
//!
//! Dispatches a parsed invocation against a registry snapshot. All
//! execution goes through the sandbox gateway; the engine process
//! never imports skill code. Failures never escape as errors: every
//! outcome is an observation the model can read.

use super::registry::RegistrySnapshot;
use crate::sandbox::{CodeRunner, ExecuteRequest, SandboxError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A model-emitted request to run a skill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub skill_name: String,
    pub payload: InvocationPayload,
}

/// Either raw code for the sandbox route or structured arguments for
/// the synthesized direct-call route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPayload {
    Code(String),
    Args(serde_json::Value),
}

impl InvocationRequest {
    pub fn code(skill_name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            payload: InvocationPayload::Code(code.into()),
        }
    }

    pub fn args(skill_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            skill_name: skill_name.into(),
            payload: InvocationPayload::Args(args),
        }
    }

    /// First line-capped preview of the payload for events/logs
    pub fn preview(&self) -> String {
        let text = match &self.payload {
            InvocationPayload::Code(code) => code.clone(),
            InvocationPayload::Args(args) => args.to_string(),
        };
        let mut preview: String = text.chars().take(200).collect();
        if preview.len() < text.len() {
            preview.push_str("...");
        }
        preview
    }
}

/// Structured result of one invocation, fed back into the transcript.
/// Always carries both a primary text and the raw payload so
/// downstream consumers never branch on shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub skill_name: String,
    pub success: bool,
    pub text: String,
    pub raw: serde_json::Value,
    pub duration_ms: u64,
}

impl Observation {
    fn failure(skill_name: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            skill_name: skill_name.to_string(),
            success: false,
            raw: serde_json::json!({ "error": text }),
            text,
            duration_ms: 0,
        }
    }
}

/// Executes invocations through the sandbox gateway
pub struct SkillExecutor {
    runner: Arc<dyn CodeRunner>,
    sandbox_skill: String,
    default_timeout_secs: u64,
}

impl SkillExecutor {
    pub fn new(
        runner: Arc<dyn CodeRunner>,
        sandbox_skill: impl Into<String>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            runner,
            sandbox_skill: sandbox_skill.into(),
            default_timeout_secs,
        }
    }

    /// Dispatch one invocation. Unknown or non-executable skills come
    /// back as error observations without touching the sandbox.
    pub async fn execute(
        &self,
        snapshot: &RegistrySnapshot,
        invocation: &InvocationRequest,
        timeout_secs: Option<u64>,
    ) -> Observation {
        let name = invocation.skill_name.as_str();
        let timeout = timeout_secs.unwrap_or(self.default_timeout_secs);

        // Raw code addressed at the sandbox itself bypasses the
        // manifest lookup: the sandbox is the execution substrate,
        // not a skill with a client class.
        if name == self.sandbox_skill {
            return match &invocation.payload {
                InvocationPayload::Code(code) => self.run(name, code.clone(), timeout).await,
                InvocationPayload::Args(_) => {
                    Observation::failure(name, "sandbox invocations require a code body")
                }
            };
        }

        let manifest = match snapshot.get(name) {
            Ok(m) => m,
            Err(_) => {
                warn!("Invocation of unknown skill `{}`", name);
                return Observation::failure(name, format!("skill `{}` not found", name));
            }
        };
        if !manifest.executable {
            return Observation::failure(
                name,
                format!("skill `{}` is documentation only and not executable", name),
            );
        }

        let code = match &invocation.payload {
            InvocationPayload::Code(code) => code.clone(),
            InvocationPayload::Args(args) => {
                let (Some(class), Some(method)) =
                    (&manifest.client_class, &manifest.default_method)
                else {
                    return Observation::failure(
                        name,
                        format!("skill `{}` does not define a callable client", name),
                    );
                };
                synthesize_call(name, class, method, args)
            }
        };

        self.run(name, code, timeout).await
    }

    async fn run(&self, skill_name: &str, code: String, timeout: u64) -> Observation {
        info!("Executing skill `{}`", skill_name);

        match self
            .runner
            .execute(ExecuteRequest::python(code, timeout))
            .await
        {
            Ok(result) => {
                let text = if result.success {
                    result.stdout.clone()
                } else if !result.stderr.is_empty() {
                    result.stderr.clone()
                } else {
                    "execution failed".to_string()
                };
                Observation {
                    skill_name: skill_name.to_string(),
                    success: result.success,
                    text,
                    duration_ms: result.duration_ms,
                    raw: serde_json::to_value(&result).unwrap_or_default(),
                }
            }
            Err(SandboxError::DeadlineExceeded(deadline)) => Observation {
                skill_name: skill_name.to_string(),
                success: false,
                text: "timeout".to_string(),
                raw: serde_json::json!({ "error": "timeout" }),
                duration_ms: deadline.as_millis() as u64,
            },
            Err(err) => {
                warn!("Sandbox error for skill `{}`: {}", skill_name, err);
                Observation::failure(skill_name, err.to_string())
            }
        }
    }
}

/// Wrapper code for the direct-call route: import the skill's client
/// and call its default method with the given keyword arguments.
fn synthesize_call(
    skill_name: &str,
    client_class: &str,
    method: &str,
    args: &serde_json::Value,
) -> String {
    // Double-encode so the JSON text embeds as a safe python literal.
    let args_literal = serde_json::to_string(&args.to_string())
        .unwrap_or_else(|_| "\"{}\"".to_string());
    format!(
        "import json\nfrom services.{skill_name}.client import {client_class}\n\nclient = {client_class}()\nresult = client.{method}(**json.loads({args_literal}))\nprint(result)\n"
    )
}
