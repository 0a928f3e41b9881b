use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CACHE_CONTROL,
};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{future::join_all, FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::time::timeout;
use tracing::warn;

use agentgate_llm::prelude::{ChatMessage, ChatRequest};

use crate::auth::is_public;
use crate::errors::{ApiError, ErrorTag};
use crate::memory::{MemoryFilter, MemoryType, NewEntry};
use crate::ratelimit::RouteClass;
use crate::state::AppState;
use crate::tasks::{NewTask, Priority, TaskFilter, TaskStatus};

const BODY_LIMIT: usize = 1_048_576;
const DEFAULT_PAGE: usize = 50;

/// Client identity computed once per request by the audit middleware and
/// reused by the rate limiter.
#[derive(Clone)]
pub struct ClientId(pub String);

/// Response extension naming the provider that served a chat call.
#[derive(Clone)]
pub struct ProviderTag(pub String);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/openapi.json", get(openapi))
        .route("/v1/chat", post(chat))
        .route("/v1/generate", post(generate))
        .route("/v1/models", get(models))
        .route("/agents", get(agents))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id/claim", post(claim_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/memory", get(list_memory).post(append_memory))
        .route("/memory/verify", get(verify_memory))
        .route("/memory/:key", get(get_memory).delete(erase_memory))
        .fallback(not_found)
        .with_state(state.clone())
        // Layer order is outside-in from the bottom: audit sees every
        // terminal response, CORS answers preflight before any quota or
        // token check, and rate limiting runs before auth so a denial
        // reveals nothing about token validity.
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(from_fn(cors_middleware))
        .layer(from_fn_with_state(state, audit_middleware))
}

// ---------------------------------------------------------------- middleware

async fn audit_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = client_key(&req);
    req.extensions_mut().insert(ClientId(client.clone()));

    let started = Instant::now();
    let response = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => ApiError::Internal("handler panicked".to_string()).into_response(),
    };

    let mut content = json!({
        "method": method.as_str(),
        "path": path,
        "status": response.status().as_u16(),
        "client": client,
        "latency_ms": started.elapsed().as_millis() as u64,
    });
    if let Some(tag) = response.extensions().get::<ErrorTag>() {
        content["error"] = json!(tag.0);
    }
    if let Some(tag) = response.extensions().get::<ProviderTag>() {
        content["provider"] = json!(tag.0);
    }
    if let Err(err) = state.audit.append(content) {
        warn!(error = %err, "audit append failed");
    }
    response
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return (
            StatusCode::NO_CONTENT,
            [
                (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (ACCESS_CONTROL_ALLOW_METHODS, "GET,POST,PUT,DELETE,OPTIONS"),
                (ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type,Authorization"),
            ],
        )
            .into_response();
    }
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if is_public(&path) {
        return next.run(req).await;
    }

    let class = RouteClass::of_path(&path);
    let client = req
        .extensions()
        .get::<ClientId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| client_key(&req));
    let decision = state.limiter.check(&client, class);

    if !decision.allowed {
        let mut response = ApiError::RateLimited {
            retry_after: decision.retry_after,
        }
        .into_response();
        stamp_rate_headers(&mut response, 0, decision.reset_unix);
        return response;
    }

    let mut response = next.run(req).await;
    stamp_rate_headers(&mut response, decision.remaining, decision.reset_unix);
    response
}

fn stamp_rate_headers(response: &mut Response, remaining: u32, reset_unix: u64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset_unix.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}

async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if is_public(path) {
        return next.run(req).await;
    }

    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    match state.auth.verify(authorization.as_deref()) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

/// Quota identity: a digest of the presented bearer token when there is
/// one (valid or not — limiting runs before auth), else the peer address.
fn client_key(req: &Request<Body>) -> String {
    if let Some(value) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let hex = format!("{:x}", hasher.finalize());
            return format!("tok:{}", &hex[..16]);
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| format!("ip:{}", info.0.ip()))
        .unwrap_or_else(|| "ip:local".to_string())
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, ApiError> {
    let bytes = to_bytes(req.into_body(), BODY_LIMIT)
        .await
        .map_err(|err| ApiError::Validation(vec![format!("body read: {err}")]))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ApiError::Validation(vec![format!("json parse: {err}")]))
}

// ------------------------------------------------------------------- public

async fn health(State(state): State<AppState>) -> Json<Value> {
    let probe = Duration::from_secs(state.config.probe_timeout_secs);
    let checks = state.registry.providers().into_iter().map(|provider| {
        let registry = state.registry.clone();
        async move {
            let alive = match registry.adapter(provider) {
                Some(adapter) => timeout(probe, adapter.health()).await.unwrap_or(false),
                None => false,
            };
            (provider, alive)
        }
    });

    let mut providers = serde_json::Map::new();
    for (provider, alive) in join_all(checks).await {
        providers.insert(provider.as_str().to_string(), json!(alive));
    }
    Json(json!({
        "status": "ok",
        "dev_mode": state.auth.is_dev(),
        "providers": providers,
    }))
}

async fn ready() -> Json<Value> {
    Json(json!({ "ready": true }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("unknown path".to_string())
}

// --------------------------------------------------------------------- chat

#[derive(Deserialize)]
struct ChatPayload {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn chat(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
    let payload: ChatPayload = read_json(req).await?;
    let chat_request = ChatRequest {
        model: payload.model,
        messages: payload.messages,
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
    };
    let violations = chat_request.validate();
    if !violations.is_empty() {
        return Err(ApiError::Validation(violations));
    }

    let (provider, adapter) = state.registry.resolve(&chat_request.model);
    let adapter = adapter.ok_or_else(|| {
        ApiError::ProviderUnavailable(format!("no binding configured for provider {provider}"))
    })?;
    let deadline = Duration::from_secs(state.config.chat_timeout_secs);

    if payload.stream {
        let deltas = timeout(deadline, adapter.chat_stream(chat_request))
            .await
            .map_err(|_| ApiError::Timeout)??;

        let audit = state.audit.clone();
        let provider_name = provider.as_str();
        let frames = async_stream::stream! {
            let mut deltas = deltas;
            while let Some(delta) = deltas.next().await {
                match delta {
                    Ok(delta) => {
                        let frame = json!({ "message": { "content": delta.content } });
                        yield Ok::<Event, Infallible>(Event::default().data(frame.to_string()));
                    }
                    Err(err) => {
                        // The terminal response already left; signal the
                        // failure on the stream and in the audit chain.
                        let tag: ApiError = err.into();
                        warn!(provider = provider_name, error = tag.kind(), "upstream stream failed");
                        if let Err(err) = audit.append(json!({
                            "event": "stream_error",
                            "provider": provider_name,
                            "error": tag.kind(),
                        })) {
                            warn!(error = %err, "audit append failed");
                        }
                        yield Ok(Event::default().event("error").data(
                            json!({ "error": tag.kind() }).to_string(),
                        ));
                        break;
                    }
                }
            }
            yield Ok(Event::default().data("[DONE]"));
        };

        let mut response = Sse::new(frames).into_response();
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
            .headers_mut()
            .insert("x-accel-buffering", HeaderValue::from_static("no"));
        response
            .extensions_mut()
            .insert(ProviderTag(provider_name.to_string()));
        Ok(response)
    } else {
        let chat_response = timeout(deadline, adapter.chat(chat_request))
            .await
            .map_err(|_| ApiError::Timeout)??;
        let mut response = Json(chat_response).into_response();
        response
            .extensions_mut()
            .insert(ProviderTag(provider.as_str().to_string()));
        Ok(response)
    }
}

#[derive(Deserialize)]
struct GeneratePayload {
    #[serde(default)]
    model: String,
    #[serde(default)]
    prompt: String,
}

/// Legacy prompt-completion surface, local-provider shaped.
async fn generate(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
    let payload: GeneratePayload = read_json(req).await?;
    if payload.prompt.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "prompt must be a non-empty string".to_string(),
        ]));
    }
    let chat_request = ChatRequest {
        model: payload.model,
        messages: vec![ChatMessage::user(payload.prompt)],
        temperature: None,
        max_tokens: None,
    };
    let violations = chat_request.validate();
    if !violations.is_empty() {
        return Err(ApiError::Validation(violations));
    }

    let (provider, adapter) = state.registry.resolve(&chat_request.model);
    let adapter = adapter.ok_or_else(|| {
        ApiError::ProviderUnavailable(format!("no binding configured for provider {provider}"))
    })?;
    let deadline = Duration::from_secs(state.config.chat_timeout_secs);
    let chat_response = timeout(deadline, adapter.chat(chat_request))
        .await
        .map_err(|_| ApiError::Timeout)??;

    let mut response = Json(json!({
        "model": chat_response.model,
        "response": chat_response.message.content,
        "done": true,
    }))
    .into_response();
    response
        .extensions_mut()
        .insert(ProviderTag(provider.as_str().to_string()));
    Ok(response)
}

async fn models(State(state): State<AppState>) -> Json<Value> {
    let probe = Duration::from_secs(state.config.probe_timeout_secs);
    let fetches = state.registry.providers().into_iter().map(|provider| {
        let registry = state.registry.clone();
        async move {
            let listed = match registry.adapter(provider) {
                Some(adapter) => timeout(probe, adapter.models()).await.ok(),
                None => None,
            };
            (provider, listed)
        }
    });

    let mut providers = serde_json::Map::new();
    for (provider, listed) in join_all(fetches).await {
        let (available, model_names) = match listed {
            Some(Ok(model_names)) => (true, model_names),
            _ => (false, Vec::new()),
        };
        providers.insert(
            provider.as_str().to_string(),
            json!({ "available": available, "models": model_names }),
        );
    }
    Json(json!({ "providers": providers }))
}

async fn agents(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "agents": state.config.agents,
        "count": state.config.agents.len(),
    }))
}

// -------------------------------------------------------------------- tasks

#[derive(Deserialize)]
struct TaskQuery {
    status: Option<TaskStatus>,
    priority: Option<Priority>,
    agent: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Json<Value> {
    let filter = TaskFilter {
        status: query.status,
        priority: query.priority,
        agent: query.agent,
    };
    let (tasks, total) = state.tasks.list(
        &filter,
        query.limit.unwrap_or(DEFAULT_PAGE),
        query.offset.unwrap_or(0),
    );
    Json(json!({ "tasks": tasks, "total": total }))
}

async fn create_task(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<impl IntoResponse, ApiError> {
    let new: NewTask = read_json(req).await?;
    if new.title.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "title must be a non-empty string".to_string(),
        ]));
    }
    Ok((StatusCode::CREATED, Json(state.tasks.create(new))))
}

#[derive(Deserialize)]
struct ClaimPayload {
    agent: String,
}

async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request<Body>,
) -> Result<impl IntoResponse, ApiError> {
    let payload: ClaimPayload = read_json(req).await?;
    if payload.agent.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "agent must be a non-empty string".to_string(),
        ]));
    }
    Ok(Json(state.tasks.claim(&id, &payload.agent)?))
}

#[derive(Deserialize)]
struct CompletePayload {
    agent: String,
    #[serde(default)]
    summary: Option<String>,
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request<Body>,
) -> Result<impl IntoResponse, ApiError> {
    let payload: CompletePayload = read_json(req).await?;
    if payload.agent.trim().is_empty() {
        return Err(ApiError::Validation(vec![
            "agent must be a non-empty string".to_string(),
        ]));
    }
    Ok(Json(state.tasks.complete(&id, &payload.agent, payload.summary)?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tasks.cancel(&id)?))
}

// ------------------------------------------------------------------- memory

#[derive(Deserialize)]
struct MemoryQuery {
    key: Option<String>,
    #[serde(rename = "type")]
    kind: Option<MemoryType>,
    include_erased: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_memory(
    State(state): State<AppState>,
    Query(query): Query<MemoryQuery>,
) -> Json<Value> {
    let filter = MemoryFilter {
        key: query.key,
        kind: query.kind,
        include_erased: query.include_erased.unwrap_or(false),
    };
    let (entries, total) = state.memory.list(
        &filter,
        query.limit.unwrap_or(DEFAULT_PAGE),
        query.offset.unwrap_or(0),
    );
    Json(json!({ "entries": entries, "total": total }))
}

async fn append_memory(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<impl IntoResponse, ApiError> {
    let entry: NewEntry = read_json(req).await?;
    let mut violations = Vec::new();
    if entry.key.trim().is_empty() {
        violations.push("key must be a non-empty string".to_string());
    }
    if !(-1..=1).contains(&entry.truth_state) {
        violations.push(format!(
            "truth_state {} outside {{-1, 0, 1}}",
            entry.truth_state
        ));
    }
    if !violations.is_empty() {
        return Err(ApiError::Validation(violations));
    }

    let stored = state
        .memory
        .append(entry)
        .map_err(|err| ApiError::Internal(format!("memory append: {err}")))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .memory
        .latest(&key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("memory key not found".to_string()))
}

async fn erase_memory(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let erased = state
        .memory
        .erase(&key)
        .map_err(|err| ApiError::Internal(format!("memory erase: {err}")))?;
    match erased {
        Some(entry) => Ok(Json(json!({ "erased": true, "hash": entry.hash }))),
        None => Err(ApiError::NotFound("memory key not found".to_string())),
    }
}

async fn verify_memory(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.memory.verify()))
}

// ------------------------------------------------------------------ openapi

async fn openapi() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": "agentgate",
            "description": "Trust-boundary gateway mediating AI-provider access for untrusted agents",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/health": { "get": { "summary": "Instance and provider availability" } },
            "/ready": { "get": { "summary": "Readiness probe" } },
            "/openapi.json": { "get": { "summary": "This document" } },
            "/v1/chat": { "post": { "summary": "Unified chat across providers; set stream:true for server-sent events" } },
            "/v1/generate": { "post": { "summary": "Legacy prompt completion" } },
            "/v1/models": { "get": { "summary": "Per-provider model list" } },
            "/agents": { "get": { "summary": "Static agent roster" } },
            "/tasks": {
                "get": { "summary": "List tasks (priority desc, created asc)" },
                "post": { "summary": "Create a task" }
            },
            "/tasks/{id}/claim": { "post": { "summary": "Claim an available task" } },
            "/tasks/{id}/complete": { "post": { "summary": "Complete a claimed task" } },
            "/tasks/{id}/cancel": { "post": { "summary": "Cancel an available task" } },
            "/memory": {
                "get": { "summary": "List memory entries" },
                "post": { "summary": "Append a memory entry" }
            },
            "/memory/{key}": {
                "get": { "summary": "Newest entry for a key" },
                "delete": { "summary": "Redactively erase the newest entry for a key" }
            },
            "/memory/verify": { "get": { "summary": "Verify the memory chain" } }
        }
    }))
}
