// Lucy Engine — Model Providers
// Outbound HTTP to OpenAI-compatible /chat/completions endpoints.
// The router never talks HTTP directly; it goes through this layer so the
// provider can be swapped for a scripted stub in tests.

pub mod openai;

use crate::atoms::types::{Message, TokenUsage, ToolCall, ToolDefinition};
use async_trait::async_trait;
use thiserror::Error;

/// One completed (non-streaming) chat completion.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    /// The model the API confirmed it used.
    pub model: String,
}

/// Provider-level failures, classified for fallback and degradation logic.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
}

impl ProviderError {
    /// Whether a fallback model is worth trying after this failure.
    /// Auth errors poison every model behind the same key.
    pub fn is_fallback_worthy(&self) -> bool {
        !matches!(self, ProviderError::Auth(_))
    }
}

/// The surface the router depends on.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ProviderReply, ProviderError>;
}
