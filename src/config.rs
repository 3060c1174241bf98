//! Configuration management
//!
//! All settings are read from environment variables with sensible
//! defaults, so the server can start with nothing but an LLM endpoint
//! configured.

use anyhow::Result;
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub host: String,

    /// HTTP port
    pub port: u16,

    /// SQLite database path for sessions, messages and memories
    pub db_path: PathBuf,

    /// Root directory scanned for SKILL.md manifests
    pub skills_directory: PathBuf,

    /// OpenAI-compatible chat completions base URL
    pub llm_base_url: String,

    /// Default model name
    pub llm_model: String,

    /// API key for the LLM backend (optional for local backends)
    pub llm_api_key: Option<String>,

    /// Sandbox service base URL
    pub sandbox_base_url: String,

    /// Default sandbox execution timeout in seconds
    pub sandbox_timeout_secs: u64,

    /// Skill name that routes raw code straight to the sandbox
    pub sandbox_skill_name: String,

    /// Rerank service base URL (memory candidate selection)
    pub rerank_base_url: String,

    /// Rerank model name sent with each request
    pub rerank_model: Option<String>,

    /// Maximum skill invocations per request
    pub max_iterations: u32,

    /// Default sampling temperature
    pub default_temperature: f32,

    /// Default max output tokens
    pub default_max_tokens: u32,

    /// Per-invocation skill execution timeout in seconds
    pub tool_timeout_secs: u64,

    /// Memory retrieval: candidates kept after rerank
    pub memory_top_k: usize,

    /// Memory retrieval: minimum rerank score for a candidate
    pub memory_score_floor: f32,

    /// Memory retrieval: user turns required before retrieval runs
    pub memory_min_user_turns: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let host = env_or("AGENT_HOST", "0.0.0.0");
        let port = parse_env("AGENT_PORT", 8020u16);

        let db_path = std::env::var("AGENT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/skillbot.db"));

        let skills_directory = std::env::var("SKILLS_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("skills"));

        let sandbox_base_url = std::env::var("SANDBOX_BASE_URL").unwrap_or_else(|_| {
            let host = env_or("SANDBOX_HOST", "127.0.0.1");
            let port = env_or("SANDBOX_PORT", "8009");
            format!("http://{}:{}", host, port)
        });

        let rerank_base_url = std::env::var("RERANK_BASE_URL").unwrap_or_else(|_| {
            let host = env_or("RERANK_HOST", "127.0.0.1");
            let port = env_or("RERANK_PORT", "8003");
            format!("http://{}:{}", host, port)
        });

        Ok(Self {
            host,
            port,
            db_path,
            skills_directory,
            llm_base_url: env_or("LLM_BASE_URL", "http://127.0.0.1:8000/v1"),
            llm_model: env_or("LLM_MODEL_NAME", "default"),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            sandbox_base_url,
            sandbox_timeout_secs: parse_env("SANDBOX_TIMEOUT", 60u64),
            sandbox_skill_name: env_or("SANDBOX_SKILL_NAME", "sandbox_service"),
            rerank_base_url,
            rerank_model: std::env::var("RERANK_MODEL_NAME").ok(),
            max_iterations: parse_env("AGENT_MAX_ITERATIONS", 10u32),
            default_temperature: parse_env("AGENT_DEFAULT_TEMPERATURE", 0.7f32),
            default_max_tokens: parse_env("AGENT_DEFAULT_MAX_TOKENS", 4096u32),
            tool_timeout_secs: parse_env("AGENT_TOOL_TIMEOUT", 60u64),
            memory_top_k: parse_env("MEMORY_TOP_K", 20usize),
            memory_score_floor: parse_env("MEMORY_SCORE_FLOOR", 0.3f32),
            memory_min_user_turns: parse_env("MEMORY_MIN_USER_TURNS", 4u64),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
