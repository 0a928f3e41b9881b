use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use config::Config;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitSettings;

/// One entry of the static agent roster served at `/agents`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub model: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// HMAC signing secret for bearer tokens. Absent → development mode.
    pub auth_secret: Option<String>,
    pub ollama_url: String,
    pub memory_journal: Option<PathBuf>,
    pub audit_journal: Option<PathBuf>,
    pub limits: RateLimitSettings,
    pub agents: Vec<AgentInfo>,
    pub chat_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// In-memory audit retention when no journal is configured.
    pub audit_retain: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            auth_secret: None,
            ollama_url: agentgate_llm::provider::ollama::DEFAULT_BASE_URL.to_string(),
            memory_journal: None,
            audit_journal: None,
            limits: RateLimitSettings::default(),
            agents: default_roster(),
            chat_timeout_secs: 120,
            probe_timeout_secs: 3,
            audit_retain: 1_000,
        }
    }
}

impl GatewayConfig {
    /// Defaults, then an optional TOML file named by `GATEWAY_CONFIG_FILE`,
    /// then `GATEWAY_*` environment variables. The unprefixed variables of
    /// the deployment contract (`OLLAMA_URL`, `MEMORY_JOURNAL`,
    /// `AUDIT_JOURNAL`) are overlaid last.
    pub fn load() -> anyhow::Result<Self> {
        let config_file =
            env::var("GATEWAY_CONFIG_FILE").unwrap_or_else(|_| "config/gateway.toml".to_string());

        let mut builder = Config::builder();
        if Path::new(&config_file).exists() {
            builder = builder.add_source(config::File::from(Path::new(&config_file)));
        }
        builder = builder.add_source(config::Environment::with_prefix("GATEWAY").separator("__"));

        let mut config: GatewayConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        if let Ok(url) = env::var("OLLAMA_URL") {
            if !url.is_empty() {
                config.ollama_url = url;
            }
        }
        if let Ok(path) = env::var("MEMORY_JOURNAL") {
            if !path.is_empty() {
                config.memory_journal = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = env::var("AUDIT_JOURNAL") {
            if !path.is_empty() {
                config.audit_journal = Some(PathBuf::from(path));
            }
        }

        Ok(config)
    }
}

fn default_roster() -> Vec<AgentInfo> {
    vec![
        AgentInfo {
            id: "coordinator".into(),
            name: "Coordinator".into(),
            role: "routes work across the roster".into(),
            kind: "orchestrator".into(),
            status: "active".into(),
            model: "claude-3-5-sonnet".into(),
        },
        AgentInfo {
            id: "researcher".into(),
            name: "Researcher".into(),
            role: "gathers and summarizes context".into(),
            kind: "worker".into(),
            status: "active".into(),
            model: "gpt-4o-mini".into(),
        },
        AgentInfo {
            id: "scribe".into(),
            name: "Scribe".into(),
            role: "maintains the memory chain".into(),
            kind: "worker".into(),
            status: "active".into(),
            model: "qwen2.5:3b".into(),
        },
    ]
}
