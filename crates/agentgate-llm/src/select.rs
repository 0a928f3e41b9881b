use std::fmt;

use serde::{Deserialize, Serialize};

/// Upstream provider identity. Selection yields an identity only; whether
/// an adapter is actually configured for it is the registry's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    Together,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Together => "together",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a model name to its provider. Ordered prefix rules, first match
/// wins; anything unmatched routes to the local provider, so the mapping
/// is total over non-empty model strings.
pub fn pick_provider(model: &str) -> Provider {
    if model.starts_with("claude") {
        Provider::Anthropic
    } else if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("o3") {
        Provider::OpenAi
    } else if model.starts_with("gemini") {
        Provider::Gemini
    } else if model.contains('/') {
        Provider::Together
    } else {
        Provider::Ollama
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_rules_route_as_documented() {
        assert_eq!(pick_provider("gpt-4o"), Provider::OpenAi);
        assert_eq!(pick_provider("o1-preview"), Provider::OpenAi);
        assert_eq!(pick_provider("o3-mini"), Provider::OpenAi);
        assert_eq!(pick_provider("claude-3-5-sonnet"), Provider::Anthropic);
        assert_eq!(pick_provider("gemini-1.5"), Provider::Gemini);
        assert_eq!(pick_provider("meta-llama/Llama-3.1-8B"), Provider::Together);
        assert_eq!(pick_provider("qwen2.5:3b"), Provider::Ollama);
    }

    #[test]
    fn selection_is_idempotent_and_total() {
        for model in ["gpt-x", "claude", "gemini", "a/b", "mystery-model", "x"] {
            assert_eq!(pick_provider(model), pick_provider(model));
        }
    }

    #[test]
    fn earlier_rules_win() {
        // "gpt-neox/20b" contains a slash but the gpt prefix fires first.
        assert_eq!(pick_provider("gpt-neox/20b"), Provider::OpenAi);
    }
}
