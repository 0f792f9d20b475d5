pub mod models;
pub mod prompts;
pub mod providers;
#[cfg(test)]
pub(crate) mod scripted;
pub mod sse;

use crate::config::LlmConfig;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub use models::{ChatMessage, CompletionRequest, Role, StreamChunk, TokenUsage};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
    #[error("prompt template error: {0}")]
    TemplateError(#[from] minijinja::Error),
}

/// Incremental completion output, ending after the chunk carrying usage.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChatStream, LlmError>;
}

pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider: Arc<dyn LlmProvider> = match config.backend.as_str() {
        "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
        "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
        "anthropic" => Arc::new(providers::anthropic::AnthropicProvider::new(config)?),
        _ => {
            return Err(LlmError::ConfigError(format!(
                "Unsupported LLM backend: {}",
                config.backend
            )))
        }
    };

    Ok(provider)
}
