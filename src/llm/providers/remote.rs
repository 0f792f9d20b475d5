use crate::config::LlmConfig;
use crate::llm::sse::{line_stream, sse_event, SseEvent};
use crate::llm::{ChatStream, CompletionRequest, LlmError, LlmProvider, StreamChunk, TokenUsage};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// OpenAI-compatible chat completions endpoint (OpenAI, Groq, vLLM, LM Studio...).
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

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

    fn build_request(&self, request: &CompletionRequest) -> PromptRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(Message {
            role: "system".to_string(),
            content: request.system.clone(),
        });
        messages.extend(request.messages.iter().map(|m| Message {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        PromptRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

/// Maps one SSE data payload to a chunk. `None` for payloads that carry
/// neither text nor usage.
fn parse_data(data: &str) -> Option<Result<StreamChunk, LlmError>> {
    let response = match serde_json::from_str::<StreamResponse>(data) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to parse streamed completion chunk: {} - {}", e, data);
            return Some(Err(LlmError::ResponseError(format!(
                "Malformed stream chunk: {}",
                e
            ))));
        }
    };

    let delta: String = response
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();
    let usage = response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

    if delta.is_empty() && usage.is_none() {
        return None;
    }
    Some(Ok(StreamChunk { delta, usage }))
}

#[async_trait]
impl LlmProvider for RemoteLlmProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        let body = self.build_request(request);

        info!("Sending streaming request to {} with model: {}", self.api_url, self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!("API responded with status code: {} - {}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                status
            )));
        }

        let stream = line_stream(response.bytes_stream())
            .take_while(|line| {
                let done = matches!(line, Ok(l) if sse_event(l) == Some(SseEvent::Done));
                futures_util::future::ready(!done)
            })
            .filter_map(|line| {
                let chunk = match line {
                    Err(e) => Some(Err(e)),
                    Ok(line) => match sse_event(&line) {
                        Some(SseEvent::Data(data)) => parse_data(&data),
                        _ => None,
                    },
                };
                futures_util::future::ready(chunk)
            })
            .inspect(|chunk| {
                if let Ok(StreamChunk { usage: Some(usage), .. }) = chunk {
                    debug!("Remote completion usage: {:?}", usage);
                }
            });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    fn provider() -> RemoteLlmProvider {
        let config = LlmConfig {
            backend: "remote".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: Some("sk-test".to_string()),
            api_url: Some("http://localhost:9/v1/chat/completions".to_string()),
            request_timeout_seconds: 5,
            temperature: 0.1,
        };
        RemoteLlmProvider::new(&config).unwrap()
    }

    #[test]
    fn request_puts_system_prompt_first_and_enables_usage() {
        let request = CompletionRequest {
            system: "be precise".to_string(),
            messages: vec![ChatMessage::user("hello")],
            max_tokens: 2000,
        };
        let body = serde_json::to_value(provider().build_request(&request)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn parse_data_extracts_delta_and_usage() {
        let chunk = parse_data(r#"{"choices":[{"delta":{"content":"SEL"}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk, StreamChunk::text("SEL"));

        let usage = parse_data(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(usage.usage, Some(TokenUsage::new(12, 3)));

        assert!(parse_data(r#"{"choices":[{"delta":{}}]}"#).is_none());
        assert!(parse_data("not json").unwrap().is_err());
    }
}
