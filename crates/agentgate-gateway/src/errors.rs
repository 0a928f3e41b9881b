use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use agentgate_llm::errors::LlmError;

/// The wire error taxonomy. Every terminal failure the gateway produces
/// maps onto one of these, serialized as `{error, message?, errors?,
/// retry_after?}` with a stable status code.
#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<String>),
    Unauthorized(String),
    #[allow(dead_code)] // reserved: the role model is minimal for now
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    RateLimited { retry_after: u64 },
    Provider(String),
    ProviderUnavailable(String),
    Timeout,
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Provider(_) => "provider_error",
            ApiError::ProviderUnavailable(_) => "provider_unavailable",
            ApiError::Timeout => "timeout",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Provider(_) | ApiError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => ApiError::Timeout,
            LlmError::Schema(msg) => ApiError::Validation(vec![msg]),
            LlmError::Unavailable(msg) | LlmError::Upstream(msg) => ApiError::Provider(msg),
        }
    }
}

/// Response extension read by the audit middleware so the emitted record
/// can carry a short error tag.
#[derive(Clone)]
pub struct ErrorTag(pub &'static str);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = self.status();
        let mut body = json!({ "error": kind });
        match &self {
            ApiError::Validation(errors) => {
                body["errors"] = json!(errors);
            }
            ApiError::RateLimited { retry_after } => {
                body["retry_after"] = json!(retry_after);
            }
            ApiError::Timeout => {
                body["message"] = json!("request deadline exceeded");
            }
            ApiError::Internal(detail) => {
                // Full detail goes to the log and the audit record; the
                // wire body stays minimal and stable.
                tracing::error!(detail = %detail, "unhandled gateway error");
            }
            ApiError::Unauthorized(message)
            | ApiError::Forbidden(message)
            | ApiError::NotFound(message)
            | ApiError::Conflict(message)
            | ApiError::Provider(message)
            | ApiError::ProviderUnavailable(message) => {
                body["message"] = json!(message);
            }
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response.extensions_mut().insert(ErrorTag(kind));
        response
    }
}
