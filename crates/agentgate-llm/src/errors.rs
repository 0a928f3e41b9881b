use thiserror::Error;

/// Failures surfaced by provider adapters. Messages are safe to put on
/// the wire: upstream excerpts are truncated and scrubbed of credential
/// material before they are attached here.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider cannot be reached or is not configured.
    #[error("{0}")]
    Unavailable(String),
    /// The provider answered with a non-2xx status or broke mid-stream.
    #[error("{0}")]
    Upstream(String),
    /// The request cannot be expressed against this provider.
    #[error("{0}")]
    Schema(String),
    /// The upstream call exceeded its deadline.
    #[error("upstream deadline exceeded")]
    Timeout,
}

impl LlmError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        LlmError::Unavailable(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        LlmError::Upstream(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        LlmError::Schema(msg.into())
    }
}

const EXCERPT_MAX: usize = 200;

/// Shorten an upstream body for error reporting and strip any occurrence
/// of the configured credentials. Every adapter routes upstream text
/// through here before building an [`LlmError`].
pub fn redact_excerpt(body: &str, secrets: &[&str]) -> String {
    let mut excerpt = body.trim().to_string();
    for secret in secrets {
        if !secret.is_empty() {
            excerpt = excerpt.replace(secret, "[redacted]");
        }
    }
    if excerpt.len() > EXCERPT_MAX {
        let cut = excerpt
            .char_indices()
            .take_while(|(at, _)| *at <= EXCERPT_MAX)
            .last()
            .map(|(at, _)| at)
            .unwrap_or(0);
        excerpt.truncate(cut);
        excerpt.push('…');
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_strips_secrets() {
        let body = r#"{"error":"invalid key sk-live-abc123 supplied"}"#;
        let excerpt = redact_excerpt(body, &["sk-live-abc123"]);
        assert!(!excerpt.contains("sk-live-abc123"));
        assert!(excerpt.contains("[redacted]"));
    }

    #[test]
    fn excerpt_is_bounded() {
        let body = "x".repeat(10_000);
        let excerpt = redact_excerpt(&body, &[]);
        assert!(excerpt.len() <= EXCERPT_MAX + '…'.len_utf8() + 4);
    }

    #[test]
    fn empty_secret_is_ignored() {
        assert_eq!(redact_excerpt("plain body", &[""]), "plain body");
    }
}
