use std::env;
use std::sync::Arc;

use tracing::{info, warn};

use agentgate_chain::AppendLog;
use agentgate_llm::prelude::{
    AnthropicAdapter, AnthropicConfig, OllamaAdapter, OllamaConfig, OpenAiAdapter, OpenAiConfig,
    Provider, Registry,
};

use crate::auth::AuthVerifier;
use crate::config::GatewayConfig;
use crate::memory::MemoryService;
use crate::ratelimit::RateLimiter;
use crate::tasks::TaskStore;

/// Everything a handler needs, wired once at startup and injected through
/// axum state. One chain per journal; no module-level singletons, so a
/// process can host several independent instances (tests do).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    pub auth: Arc<AuthVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub tasks: Arc<TaskStore>,
    pub memory: Arc<MemoryService>,
    pub audit: Arc<AppendLog>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let registry = build_registry(&config)?;
        Self::with_registry(config, registry)
    }

    /// Wiring seam used by tests to point adapters at mock upstreams.
    pub fn with_registry(config: GatewayConfig, registry: Registry) -> anyhow::Result<Self> {
        let auth = AuthVerifier::from_secret(config.auth_secret.as_deref());
        if auth.is_dev() {
            warn!("no GATEWAY_AUTH_SECRET configured; running in development mode with a synthetic admin principal");
        }

        let memory_chain = match &config.memory_journal {
            Some(path) => AppendLog::open(path)?,
            None => AppendLog::in_memory(),
        };
        let audit = AppendLog::open_or_bounded(config.audit_journal.as_ref(), config.audit_retain)?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.limits.clone())),
            auth: Arc::new(auth),
            tasks: Arc::new(TaskStore::new(AppendLog::in_memory())),
            memory: Arc::new(MemoryService::new(memory_chain)),
            audit: Arc::new(audit),
            registry: Arc::new(registry),
            config: Arc::new(config),
        })
    }
}

fn build_registry(config: &GatewayConfig) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();

    if let Ok(key) = env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            let mut provider_config = OpenAiConfig::new(key)?;
            if let Ok(base) = env::var("OPENAI_BASE_URL") {
                provider_config = provider_config.with_base_url(base)?;
            }
            registry.register(Provider::OpenAi, Arc::new(OpenAiAdapter::new(provider_config)?));
            info!("openai provider installed");
        }
    }

    if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            let mut provider_config = AnthropicConfig::new(key)?;
            if let Ok(base) = env::var("ANTHROPIC_BASE_URL") {
                provider_config = provider_config.with_base_url(base)?;
            }
            registry.register(
                Provider::Anthropic,
                Arc::new(AnthropicAdapter::new(provider_config)?),
            );
            info!("anthropic provider installed");
        }
    }

    // The local provider is always bound; it is the selector's tail rule.
    let ollama = OllamaAdapter::new(OllamaConfig::new(&config.ollama_url)?)?;
    registry.register(Provider::Ollama, Arc::new(ollama));
    info!(url = %config.ollama_url, "ollama provider installed");

    Ok(registry)
}
