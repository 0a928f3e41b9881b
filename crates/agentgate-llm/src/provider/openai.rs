use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::errors::{redact_excerpt, LlmError};
use crate::model::{ChatDelta, ChatMessage, ChatRequest, ChatResponse};
use crate::provider::{parse_base_url, send_retry_once, DeltaStream, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/";
const CHAT_PATH: &str = "v1/chat/completions";
const MODELS_PATH: &str = "v1/models";

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Url,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
}

impl OpenAiConfig {
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

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }
}

struct OpenAiShared {
    client: Client,
    chat_url: Url,
    models_url: Url,
    limiter: Arc<tokio::sync::Semaphore>,
    api_key: String,
}

impl OpenAiShared {
    fn scrub(&self, text: &str) -> String {
        redact_excerpt(text, &[&self.api_key])
    }

    fn transport_error(&self, err: &reqwest::Error) -> LlmError {
        LlmError::unavailable(format!("openai request error: {}", self.scrub(&err.to_string())))
    }

    fn upstream_error(&self, status: StatusCode, body: &str) -> LlmError {
        LlmError::upstream(format!(
            "openai returned {}: {}",
            status.as_u16(),
            self.scrub(body)
        ))
    }
}

pub struct OpenAiAdapter {
    shared: Arc<OpenAiShared>,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = format!("Bearer {}", config.api_key);
        let mut auth_value = HeaderValue::from_str(&auth)
            .map_err(|err| LlmError::unavailable(format!("invalid openai api key: {err}")))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| LlmError::unavailable(format!("openai client build failed: {err}")))?;

        let chat_url = config
            .base_url
            .join(CHAT_PATH)
            .map_err(|err| LlmError::unavailable(format!("openai chat url join failed: {err}")))?;
        let models_url = config
            .base_url
            .join(MODELS_PATH)
            .map_err(|err| LlmError::unavailable(format!("openai models url join failed: {err}")))?;

        Ok(Self {
            shared: Arc::new(OpenAiShared {
                client,
                chat_url,
                models_url,
                limiter: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_requests)),
                api_key: config.api_key,
            }),
        })
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: InboundMessage,
}

#[derive(Deserialize)]
struct InboundMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Deserialize, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
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
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let _permit = self
            .shared
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::unavailable(format!("openai limiter closed: {err}")))?;

        let body = CompletionBody {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
        };
        let response = send_retry_once(self.shared.client.post(self.shared.chat_url.clone()).json(&body))
            .await
            .map_err(|err| self.shared.transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.upstream_error(status, &text));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::upstream(format!("openai response decode: {err}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::upstream("openai returned no choices"))?;

        Ok(ChatResponse {
            model: req.model,
            message: ChatMessage {
                role: choice.message.role,
                content: choice.message.content.unwrap_or_default(),
            },
            prompt_eval_count: parsed.usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            eval_count: parsed
                .usage
                .as_ref()
                .and_then(|u| u.completion_tokens)
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
                .map_err(|err| LlmError::unavailable(format!("openai limiter closed: {err}")))?;

            let body = CompletionBody {
                model: &req.model,
                messages: &req.messages,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                stream: true,
            };
            let response = send_retry_once(shared.client.post(shared.chat_url.clone()).json(&body))
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
                        .map_err(|err| LlmError::upstream(format!("openai stream chunk error: {}", shared.scrub(&err.to_string()))))?;
                    let text = std::str::from_utf8(&chunk)
                        .map_err(|err| LlmError::upstream(format!("openai stream utf8 error: {err}")))?;
                    buffer.push_str(text);

                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim_end_matches('\r').to_string();
                        buffer = buffer[pos + 1..].to_string();

                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if data.is_empty() {
                                continue;
                            }
                            if data == "[DONE]" {
                                done = true;
                                break;
                            }
                            let chunk: StreamChunk = serde_json::from_str(data).map_err(|err| {
                                LlmError::upstream(format!("openai stream decode error: {err}"))
                            })?;
                            if let Some(content) = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|choice| choice.delta.content)
                            {
                                if !content.is_empty() {
                                    yield ChatDelta { content };
                                }
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
            .map_err(|err| LlmError::upstream(format!("openai models decode: {err}")))?;
        Ok(parsed.data.into_iter().map(|entry| entry.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::user("Say hi")],
            temperature: Some(0.1),
            max_tokens: Some(32),
        }
    }

    async fn adapter_for(server: &MockServer) -> OpenAiAdapter {
        let config = OpenAiConfig::new("test-key")
            .unwrap()
            .with_base_url(server.uri())
            .unwrap();
        OpenAiAdapter::new(config).unwrap()
    }

    #[tokio::test]
    async fn chat_normalizes_choice_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{CHAT_PATH}")))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "finish_reason": "stop",
                    "message": {"role": "assistant", "content": "hello there"}
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 6, "total_tokens": 18}
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let response = adapter.chat(sample_request()).await.unwrap();

        assert_eq!(response.message.role, "assistant");
        assert_eq!(response.message.content, "hello there");
        assert_eq!(response.prompt_eval_count, 12);
        assert_eq!(response.eval_count, 6);
    }

    #[tokio::test]
    async fn chat_stream_parses_sse_frames() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path(format!("/{CHAT_PATH}")))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("content-type", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let mut stream = adapter.chat_stream(sample_request()).await.unwrap();
        let mut collected = Vec::new();
        while let Some(delta) = stream.next().await {
            collected.push(delta.unwrap().content);
        }
        assert_eq!(collected, vec!["Hello", " ", "world"]);
    }

    #[tokio::test]
    async fn upstream_failure_is_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{CHAT_PATH}")))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":"bad key test-key rejected"}"#),
            )
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let err = adapter.chat(sample_request()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("401"), "unexpected error: {message}");
        assert!(!message.contains("test-key"), "credential leaked: {message}");
    }

    #[tokio::test]
    async fn models_lists_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{MODELS_PATH}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let models = adapter.models().await.unwrap();
        assert_eq!(models, vec!["gpt-4o", "gpt-4o-mini"]);
        assert!(adapter.health().await);
    }
}
