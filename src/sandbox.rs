//! Sandbox Gateway
//!
//! Typed client for the external code-execution service. Every skill
//! invocation is routed through here: the engine never loads skill
//! code into its own process. `trusted_mode` grants the sandbox access
//! to the internal service network and is always set by the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Extra wall-clock allowance on top of the sandbox's own timeout,
/// covering connection setup and response transfer.
const NETWORK_SLACK_SECS: u64 = 5;

/// Request accepted by the sandbox `/execute` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    pub trusted_mode: bool,
    pub timeout: u64,
}

impl ExecuteRequest {
    /// Trusted python execution, the shape the engine always uses
    pub fn python(code: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            code: code.into(),
            language: "python".to_string(),
            trusted_mode: true,
            timeout: timeout_secs,
        }
    }
}

/// Result returned by the sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Sandbox transport and deadline errors. Functional failures
/// (non-zero exit, stderr) are not errors: they come back inside
/// `ExecuteResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sandbox returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sandbox deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// Seam for the code execution backend, mockable in tests
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResult, SandboxError>;
}

/// HTTP client for the sandbox service
pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
    default_timeout_secs: u64,
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>, default_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_timeout_secs,
        }
    }

    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs
    }

    /// GET /health on the sandbox service
    pub async fn health_check(&self) -> Result<serde_json::Value, SandboxError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SandboxError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn post_execute(
        &self,
        req: &ExecuteRequest,
        deadline: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.http
            .post(format!("{}/execute", self.base_url))
            .json(req)
            .timeout(deadline)
            .send()
            .await
    }
}

#[async_trait]
impl CodeRunner for SandboxClient {
    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResult, SandboxError> {
        let deadline = Duration::from_secs(req.timeout + NETWORK_SLACK_SECS);
        debug!(
            "Sandbox execute: language={}, timeout={}s, code_len={}",
            req.language,
            req.timeout,
            req.code.len()
        );

        let response = match self.post_execute(&req, deadline).await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(SandboxError::DeadlineExceeded(deadline)),
            Err(e) if e.is_connect() => {
                // One idempotent retry for connect failures only
                warn!("Sandbox connect failed, retrying once: {}", e);
                match self.post_execute(&req, deadline).await {
                    Ok(r) => r,
                    Err(e) if e.is_timeout() => {
                        return Err(SandboxError::DeadlineExceeded(deadline))
                    }
                    Err(e) => return Err(SandboxError::Transport(e)),
                }
            }
            Err(e) => return Err(SandboxError::Transport(e)),
        };

        if !response.status().is_success() {
            return Err(SandboxError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }
}
