//! Upstream provider access for the gateway.
//!
//! Agents never see provider credentials: adapters own them, inject them
//! into upstream requests, and scrub them from anything that could flow
//! back out (error excerpts included). The selector maps a requested
//! model name to a provider identity; the registry maps identities to
//! configured adapters.

pub mod errors;
pub mod model;
pub mod provider;
pub mod registry;
pub mod select;

pub mod prelude {
    pub use crate::errors::LlmError;
    pub use crate::model::{ChatDelta, ChatMessage, ChatRequest, ChatResponse};
    pub use crate::provider::{
        anthropic::{AnthropicAdapter, AnthropicConfig},
        ollama::{OllamaAdapter, OllamaConfig},
        openai::{OpenAiAdapter, OpenAiConfig},
        DeltaStream, ProviderAdapter,
    };
    pub use crate::registry::Registry;
    pub use crate::select::{pick_provider, Provider};
}
