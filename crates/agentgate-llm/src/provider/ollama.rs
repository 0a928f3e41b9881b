use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::errors::{redact_excerpt, LlmError};
use crate::model::{ChatDelta, ChatRequest, ChatResponse};
use crate::provider::{parse_base_url, send_retry_once, DeltaStream, ProviderAdapter};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434/";
const CHAT_PATH: &str = "api/chat";
const TAGS_PATH: &str = "api/tags";

/// The local provider: no credential, responses already arrive in the
/// normalized shape and pass through untouched.
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
}

impl OllamaConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, LlmError> {
        Ok(Self {
            base_url: parse_base_url(base_url.as_ref())?,
            request_timeout: Duration::from_secs(120),
            max_concurrent_requests: 8,
        })
    }

    pub fn local() -> Self {
        Self::new(DEFAULT_BASE_URL).expect("default ollama url is valid")
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct OllamaShared {
    client: Client,
    chat_url: Url,
    tags_url: Url,
    limiter: Arc<tokio::sync::Semaphore>,
}

impl OllamaShared {
    fn transport_error(&self, err: &reqwest::Error) -> LlmError {
        LlmError::unavailable(format!("ollama request error: {err}"))
    }

    fn upstream_error(&self, status: StatusCode, body: &str) -> LlmError {
        LlmError::upstream(format!(
            "ollama returned {}: {}",
            status.as_u16(),
            redact_excerpt(body, &[])
        ))
    }
}

pub struct OllamaAdapter {
    shared: Arc<OllamaShared>,
}

impl OllamaAdapter {
    pub fn new(config: OllamaConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| LlmError::unavailable(format!("ollama client build failed: {err}")))?;
        let chat_url = config
            .base_url
            .join(CHAT_PATH)
            .map_err(|err| LlmError::unavailable(format!("ollama chat url join failed: {err}")))?;
        let tags_url = config
            .base_url
            .join(TAGS_PATH)
            .map_err(|err| LlmError::unavailable(format!("ollama tags url join failed: {err}")))?;

        Ok(Self {
            shared: Arc::new(OllamaShared {
                client,
                chat_url,
                tags_url,
                limiter: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_requests)),
            }),
        })
    }
}

#[derive(Serialize)]
struct OllamaChatBody<'a> {
    model: &'a str,
    messages: &'a [crate::model::ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

fn build_body(req: &ChatRequest, stream: bool) -> OllamaChatBody<'_> {
    let options = if req.temperature.is_some() || req.max_tokens.is_some() {
        Some(OllamaOptions {
            temperature: req.temperature,
            num_predict: req.max_tokens,
        })
    } else {
        None
    };
    OllamaChatBody {
        model: &req.model,
        messages: &req.messages,
        stream,
        options,
    }
}

#[derive(Deserialize, Default)]
struct StreamLine {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize, Default)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let _permit = self
            .shared
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::unavailable(format!("ollama limiter closed: {err}")))?;

        let body = build_body(&req, false);
        let response = send_retry_once(self.shared.client.post(self.shared.chat_url.clone()).json(&body))
            .await
            .map_err(|err| self.shared.transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.upstream_error(status, &text));
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|err| LlmError::upstream(format!("ollama response decode: {err}")))
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<DeltaStream, LlmError> {
        let shared = self.shared.clone();
        let stream = try_stream! {
            let permit = shared
                .limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| LlmError::unavailable(format!("ollama limiter closed: {err}")))?;

            let body = build_body(&req, true);
            let response = send_retry_once(shared.client.post(shared.chat_url.clone()).json(&body))
                .await
                .map_err(|err| shared.transport_error(&err))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                drop(permit);
                Err(shared.upstream_error(status, &text))?;
            } else {
                // Ollama streams newline-delimited JSON, not SSE.
                let mut body_stream = response.bytes_stream();
                let mut buffer = String::new();
                let mut done = false;

                while let Some(chunk) = body_stream.next().await {
                    let chunk = chunk
                        .map_err(|err| LlmError::upstream(format!("ollama stream chunk error: {err}")))?;
                    let text = std::str::from_utf8(&chunk)
                        .map_err(|err| LlmError::upstream(format!("ollama stream utf8 error: {err}")))?;
                    buffer.push_str(text);

                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer = buffer[pos + 1..].to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let parsed: StreamLine = serde_json::from_str(&line).map_err(|err| {
                            LlmError::upstream(format!("ollama stream decode error: {err}"))
                        })?;
                        if let Some(message) = parsed.message {
                            if !message.content.is_empty() {
                                yield ChatDelta {
                                    content: message.content,
                                };
                            }
                        }
                        if parsed.done {
                            done = true;
                            break;
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
            .get(self.shared.tags_url.clone())
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn models(&self) -> Result<Vec<String>, LlmError> {
        let response = send_retry_once(self.shared.client.get(self.shared.tags_url.clone()))
            .await
            .map_err(|err| self.shared.transport_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.shared.upstream_error(status, &text));
        }
        let parsed: TagList = response
            .json()
            .await
            .map_err(|err| LlmError::upstream(format!("ollama tags decode: {err}")))?;
        Ok(parsed.models.into_iter().map(|entry| entry.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "qwen2.5:3b".into(),
            messages: vec![ChatMessage::user("Say hi")],
            temperature: None,
            max_tokens: None,
        }
    }

    async fn adapter_for(server: &MockServer) -> OllamaAdapter {
        OllamaAdapter::new(OllamaConfig::new(server.uri()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn chat_passes_normalized_shape_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{CHAT_PATH}")))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "qwen2.5:3b",
                "message": {"role": "assistant", "content": "hello"},
                "done": true,
                "prompt_eval_count": 7,
                "eval_count": 3
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let response = adapter.chat(sample_request()).await.unwrap();
        assert_eq!(response.model, "qwen2.5:3b");
        assert_eq!(response.message.content, "hello");
        assert_eq!(response.prompt_eval_count, 7);
        assert_eq!(response.eval_count, 3);
    }

    #[tokio::test]
    async fn stream_yields_ndjson_deltas_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"model\":\"qwen2.5:3b\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
            "{\"model\":\"qwen2.5:3b\",\"message\":{\"role\":\"assistant\",\"content\":\" \"},\"done\":false}\n",
            "{\"model\":\"qwen2.5:3b\",\"message\":{\"role\":\"assistant\",\"content\":\"world\"},\"done\":false}\n",
            "{\"model\":\"qwen2.5:3b\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"eval_count\":3}\n"
        );
        Mock::given(method("POST"))
            .and(path(format!("/{CHAT_PATH}")))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("content-type", "application/x-ndjson"),
            )
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
    async fn tags_back_models_and_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{TAGS_PATH}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "qwen2.5:3b"}, {"name": "llama3.2:1b"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        assert_eq!(adapter.models().await.unwrap(), vec!["qwen2.5:3b", "llama3.2:1b"]);
        assert!(adapter.health().await);
    }

    #[tokio::test]
    async fn missing_upstream_maps_to_error() {
        let adapter =
            OllamaAdapter::new(OllamaConfig::new("http://127.0.0.1:9").unwrap()).unwrap();
        let err = adapter.chat(sample_request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }
}
