use crate::config::LlmConfig;
use crate::llm::sse::{line_stream, sse_event, SseEvent};
use crate::llm::{ChatStream, CompletionRequest, LlmError, LlmProvider, StreamChunk, TokenUsage};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API with `stream: true`.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: MessageStart },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { usage: OutputUsage },
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageStart {
    usage: InputUsage,
}

#[derive(Deserialize, Debug)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct BlockDelta {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for the anthropic provider".to_string())
        })?;
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

// message_start reports input tokens, message_delta the final output count
fn parse_data(data: &str) -> Option<Result<StreamChunk, LlmError>> {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::MessageStart { message }) => Some(Ok(StreamChunk::usage(TokenUsage::new(
            message.usage.input_tokens,
            message.usage.output_tokens,
        )))),
        Ok(StreamEvent::ContentBlockDelta { delta }) => {
            delta.text.filter(|t| !t.is_empty()).map(|t| Ok(StreamChunk::text(t)))
        }
        Ok(StreamEvent::MessageDelta { usage }) => Some(Ok(StreamChunk::usage(TokenUsage::new(
            0,
            usage.output_tokens,
        )))),
        Ok(StreamEvent::Error { error }) => Some(Err(LlmError::ResponseError(error.message))),
        Ok(StreamEvent::Other) => None,
        Err(e) => {
            error!("Failed to parse Anthropic stream event: {} - {}", e, data);
            Some(Err(LlmError::ResponseError(format!("Malformed stream event: {}", e))))
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            system: &request.system,
            messages: request
                .messages
                .iter()
                .map(|m| Message {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: self.temperature,
            stream: true,
        };

        info!("Sending streaming request to Anthropic with model: {}", self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!("Anthropic API responded with status code: {} - {}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Anthropic API responded with status code: {}",
                status
            )));
        }

        let stream = line_stream(response.bytes_stream()).filter_map(|line| {
            let chunk = match line {
                Err(e) => Some(Err(e)),
                Ok(line) => match sse_event(&line) {
                    Some(SseEvent::Data(data)) => parse_data(&data),
                    _ => None,
                },
            };
            futures_util::future::ready(chunk)
        });

        Ok(Box::pin(stream))
    }
}
