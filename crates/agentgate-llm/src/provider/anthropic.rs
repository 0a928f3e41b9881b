use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::errors::{redact_excerpt, LlmError};
use crate::model::{ChatDelta, ChatMessage, ChatRequest, ChatResponse};
use crate::provider::{parse_base_url, send_retry_once, DeltaStream, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/";
const MESSAGES_PATH: &str = "v1/messages";
const MODELS_PATH: &str = "v1/models";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: Url,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        Ok(Self {
            api_key: api_key.into(),
            base_url: parse_base_url(DEFAULT_BASE_URL)?,
            request_timeout: Duration::from_secs(120),
            max_concurrent_requests: 8,
        })
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Result<Self, LlmError> {
        self.base_url = parse_base_url(base_url.as_ref())?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct AnthropicShared {
    client: Client,
    messages_url: Url,
    models_url: Url,
    limiter: Arc<tokio::sync::Semaphore>,
    api_key: String,
}

impl AnthropicShared {
    fn scrub(&self, text: &str) -> String {
        redact_excerpt(text, &[&self.api_key])
    }

    fn transport_error(&self, err: &reqwest::Error) -> LlmError {
        LlmError::unavailable(format!(
            "anthropic request error: {}",
            self.scrub(&err.to_string())
        ))
    }

    fn upstream_error(&self, status: StatusCode, body: &str) -> LlmError {
        LlmError::upstream(format!(
            "anthropic returned {}: {}",
            status.as_u16(),
            self.scrub(body)
        ))
    }
}

pub struct AnthropicAdapter {
    shared: Arc<AnthropicShared>,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key_value = HeaderValue::from_str(&config.api_key)
            .map_err(|err| LlmError::unavailable(format!("invalid anthropic api key: {err}")))?;
        key_value.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), key_value);
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(API_VERSION),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| LlmError::unavailable(format!("anthropic client build failed: {err}")))?;

        let messages_url = config.base_url.join(MESSAGES_PATH).map_err(|err| {
            LlmError::unavailable(format!("anthropic messages url join failed: {err}"))
        })?;
        let models_url = config.base_url.join(MODELS_PATH).map_err(|err| {
            LlmError::unavailable(format!("anthropic models url join failed: {err}"))
        })?;

        Ok(Self {
            shared: Arc::new(AnthropicShared {
                client,
                messages_url,
                models_url,
                limiter: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_requests)),
                api_key: config.api_key,
            }),
        })
    }
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: Vec<&'a ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

/// Anthropic carries the system prompt out of band: any `system` role
/// messages are lifted into the top-level field, joined in order.
fn build_body(req: &ChatRequest, stream: bool) -> MessagesBody<'_> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<&ChatMessage> = Vec::new();
    for message in &req.messages {
        if message.role == "system" {
            system_parts.push(&message.content);
        } else {
            messages.push(message);
        }
    }
    MessagesBody {
        model: &req.model,
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        temperature: req.temperature,
        stream,
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<EventDelta>,
}

#[derive(Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let _permit = self
            .shared
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::unavailable(format!("anthropic limiter closed: {err}")))?;

        let body = build_body(&req, false);
        let response = send_retry_once(
            self.shared
                .client
                .post(self.shared.messages_url.clone())
                .json(&body),
        )
        .await
        .map_err(|err| self.shared.transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.upstream_error(status, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| LlmError::upstream(format!("anthropic response decode: {err}")))?;
        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(ChatResponse {
            model: req.model,
            message: ChatMessage::new("assistant", content),
            prompt_eval_count: parsed.usage.as_ref().and_then(|u| u.input_tokens).unwrap_or(0),
            eval_count: parsed
                .usage
                .as_ref()
                .and_then(|u| u.output_tokens)
                .unwrap_or(0),
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<DeltaStream, LlmError> {
        let shared = self.shared.clone();
        let stream = try_stream! {
            let permit = shared
                .limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| LlmError::unavailable(format!("anthropic limiter closed: {err}")))?;

            let body = build_body(&req, true);
            let response = send_retry_once(shared.client.post(shared.messages_url.clone()).json(&body))
                .await
                .map_err(|err| shared.transport_error(&err))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                drop(permit);
                Err(shared.upstream_error(status, &text))?;
            } else {
                let mut body_stream = response.bytes_stream();
                let mut buffer = String::new();
                let mut done = false;

                while let Some(chunk) = body_stream.next().await {
                    let chunk = chunk
                        .map_err(|err| LlmError::upstream(format!("anthropic stream chunk error: {}", shared.scrub(&err.to_string()))))?;
                    let text = std::str::from_utf8(&chunk)
                        .map_err(|err| LlmError::upstream(format!("anthropic stream utf8 error: {err}")))?;
                    buffer.push_str(text);

                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim_end_matches('\r').to_string();
                        buffer = buffer[pos + 1..].to_string();

                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if data.is_empty() {
                                continue;
                            }
                            let event: StreamEvent = serde_json::from_str(data).map_err(|err| {
                                LlmError::upstream(format!("anthropic stream decode error: {err}"))
                            })?;
                            match event.kind.as_str() {
                                // Only text deltas are forwarded; every other
                                // event kind is bookkeeping on the wire.
                                "content_block_delta" => {
                                    if let Some(text) = event.delta.and_then(|delta| delta.text) {
                                        if !text.is_empty() {
                                            yield ChatDelta { content: text };
                                        }
                                    }
                                }
                                "message_stop" => {
                                    done = true;
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }

                    if done {
                        break;
                    }
                }
                drop(permit);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health(&self) -> bool {
        self.shared
            .client
            .get(self.shared.models_url.clone())
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn models(&self) -> Result<Vec<String>, LlmError> {
        let response = send_retry_once(self.shared.client.get(self.shared.models_url.clone()))
            .await
            .map_err(|err| self.shared.transport_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.upstream_error(status, &text));
        }
        let parsed: ModelList = response
            .json()
            .await
            .map_err(|err| LlmError::upstream(format!("anthropic models decode: {err}")))?;
        Ok(parsed.data.into_iter().map(|entry| entry.id).collect())
    }
}
