use serde::{Deserialize, Serialize};

/// One turn in a conversation. `role` is one of `system`, `user`,
/// `assistant` (providers reject anything else themselves).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// The shared request envelope every adapter accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Envelope validation. Returns every violation so callers can report
    /// them all at once.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.model.trim().is_empty() {
            errors.push("model must be a non-empty string".to_string());
        }
        if self.messages.is_empty() {
            errors.push("messages must not be empty".to_string());
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                errors.push(format!("temperature {temperature} outside [0, 2]"));
            }
        }
        errors
    }
}

/// Normalized unary response. Field names follow the local-provider wire
/// shape, which passes through untouched; the hosted providers are mapped
/// onto it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: ChatMessage,
    #[serde(default)]
    pub prompt_eval_count: u32,
    #[serde(default)]
    pub eval_count: u32,
}

/// One streamed content fragment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> ChatRequest {
        ChatRequest {
            model: "qwen2.5:3b".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.7),
            max_tokens: None,
        }
    }

    #[test]
    fn valid_envelope_passes() {
        assert!(valid_request().validate().is_empty());
    }

    #[test]
    fn violations_are_collected() {
        let request = ChatRequest {
            model: "  ".into(),
            messages: vec![],
            temperature: Some(3.5),
            max_tokens: None,
        };
        let errors = request.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn temperature_bounds_are_inclusive() {
        let mut request = valid_request();
        request.temperature = Some(0.0);
        assert!(request.validate().is_empty());
        request.temperature = Some(2.0);
        assert!(request.validate().is_empty());
        request.temperature = Some(2.01);
        assert_eq!(request.validate().len(), 1);
    }
}
