//! Skillbot Agent Server - Entry Point

use skillbot::agent::{AgentEngine, EngineConfig};
use skillbot::api::{self, AppState};
use skillbot::llm::OpenAiClient;
use skillbot::memory::{MemoryConfig, MemoryRetriever, RerankClient};
use skillbot::sandbox::SandboxClient;
use skillbot::skills::{SkillExecutor, SkillRegistry};
use skillbot::store::SessionStore;
use skillbot::Config;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Skillbot Agent Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);

    let store = Arc::new(SessionStore::open(&config.db_path)?);

    let registry = match SkillRegistry::build(&config.skills_directory) {
        Ok(snapshot) => {
            info!(
                "Loaded {} skills from {}",
                snapshot.len(),
                config.skills_directory.display()
            );
            Arc::new(SkillRegistry::new(snapshot))
        }
        Err(e) => {
            warn!("Skill discovery failed, starting with empty registry: {}", e);
            Arc::new(SkillRegistry::empty(config.skills_directory.clone()))
        }
    };

    let llm: Arc<dyn skillbot::ChatBackend> = Arc::new(OpenAiClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    ));

    let sandbox = Arc::new(SandboxClient::new(
        config.sandbox_base_url.clone(),
        config.sandbox_timeout_secs,
    ));
    let executor = SkillExecutor::new(
        sandbox,
        config.sandbox_skill_name.clone(),
        config.sandbox_timeout_secs,
    );

    let memory = Arc::new(MemoryRetriever::new(
        Arc::new(RerankClient::new(
            config.rerank_base_url.clone(),
            config.rerank_model.clone(),
        )),
        llm.clone(),
        config.llm_model.clone(),
        MemoryConfig {
            top_k: config.memory_top_k,
            score_floor: config.memory_score_floor,
            min_user_turns: config.memory_min_user_turns,
        },
    ));

    let engine = Arc::new(AgentEngine::new(
        llm,
        executor,
        registry.clone(),
        store.clone(),
        memory,
        EngineConfig::from_config(&config),
    ));

    let app = api::router(Arc::new(AppState {
        store,
        registry,
        engine,
        config: config.clone(),
    }));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
