use crate::config::LlmConfig;
use crate::llm::sse::line_stream;
use crate::llm::{ChatStream, CompletionRequest, LlmError, LlmProvider, StreamChunk, TokenUsage};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaMessage {
    role: String,
    content: String,
}

// One NDJSON line of a streamed /api/chat response
#[derive(Deserialize, Debug)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/chat".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn build_request(&self, request: &CompletionRequest) -> OllamaRequest {
        let mut messages = vec![OllamaMessage {
            role: "system".to_string(),
            content: request.system.clone(),
        }];
        messages.extend(request.messages.iter().map(|m| OllamaMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        OllamaRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

fn parse_line(line: &str) -> Option<Result<StreamChunk, LlmError>> {
    let response = match serde_json::from_str::<OllamaResponse>(line) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to parse Ollama response: {} - Response was: {}", e, line);
            return Some(Err(LlmError::ResponseError(format!(
                "Failed to parse Ollama response: {}",
                e
            ))));
        }
    };

    if let Some(message) = response.error {
        return Some(Err(LlmError::ResponseError(message)));
    }

    let delta = response.message.map(|m| m.content).unwrap_or_default();
    let usage = if response.done {
        Some(TokenUsage::new(
            response.prompt_eval_count.unwrap_or(0),
            response.eval_count.unwrap_or(0),
        ))
    } else {
        None
    };

    if delta.is_empty() && usage.is_none() {
        return None;
    }
    Some(Ok(StreamChunk { delta, usage }))
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        let body = self.build_request(request);

        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        let stream = line_stream(response.bytes_stream()).filter_map(|line| {
            let chunk = match line {
                Err(e) => Some(Err(e)),
                Ok(line) => parse_line(&line),
            };
            futures_util::future::ready(chunk)
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_reads_content_and_final_counts() {
        let chunk = parse_line(r#"{"message":{"role":"assistant","content":"<sql>"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk, StreamChunk::text("<sql>"));

        let last = parse_line(
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":420,"eval_count":37}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(last.usage, Some(TokenUsage::new(420, 37)));
    }

    #[test]
    fn parse_line_surfaces_model_errors() {
        let err = parse_line(r#"{"error":"model 'sqlcoder' not found"}"#)
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
