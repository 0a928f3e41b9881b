pub mod anthropic;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::LlmError;
use crate::model::{ChatDelta, ChatRequest, ChatResponse};

pub type DeltaStream = BoxStream<'static, Result<ChatDelta, LlmError>>;

/// Per-upstream contract: request shaping and credential injection stay
/// inside the adapter; callers only ever see the normalized shapes.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError>;

    async fn chat_stream(&self, req: ChatRequest) -> Result<DeltaStream, LlmError>;

    /// Cheap liveness probe.
    async fn health(&self) -> bool;

    /// Models the upstream currently advertises.
    async fn models(&self) -> Result<Vec<String>, LlmError>;
}

/// Send a request, retrying exactly once on immediate connect failure.
/// Anything past connection establishment is the caller's to handle.
pub(crate) async fn send_retry_once(
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, reqwest::Error> {
    let retry = builder.try_clone();
    match builder.send().await {
        Err(err) if err.is_connect() => match retry {
            Some(builder) => builder.send().await,
            None => Err(err),
        },
        other => other,
    }
}

/// Base URLs are joined with relative paths, which silently drops the
/// last segment unless the base ends in a slash.
pub(crate) fn parse_base_url(raw: &str) -> Result<reqwest::Url, LlmError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    reqwest::Url::parse(&normalized)
        .map_err(|err| LlmError::unavailable(format!("base url parse failed: {err}")))
}
