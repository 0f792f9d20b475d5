use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::llm::{CompletionRequest, LlmError, LlmProvider, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    GeneratingSql,
    Analyzing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub phase: StreamPhase,
    pub chunk: String,
}

/// Fire-and-forget side channel for partial model output.
///
/// Sending never waits. Every chunk reaches the subscriber in order; one
/// turn's output is bounded by the completion's `max_tokens`, so the queue is
/// unbounded. A subscriber that has gone away is ignored.
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, phase: StreamPhase, chunk: &str) {
        let event = StreamEvent {
            phase,
            chunk: chunk.to_string(),
        };
        // the only error is a closed receiver
        let _ = self.tx.send(event);
    }
}

/// Runs one streamed completion to the end, forwarding text to `sink` and
/// returning the full text with its token usage.
///
/// Providers may report usage more than once (Anthropic sends input tokens
/// first and a cumulative output count at the end), so each field keeps the
/// largest value seen.
pub async fn collect_completion(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    sink: Option<&StreamSink>,
    phase: StreamPhase,
) -> Result<(String, TokenUsage), LlmError> {
    let mut stream = provider.complete_stream(request).await?;
    let mut text = String::new();
    let mut usage = TokenUsage::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if !chunk.delta.is_empty() {
            if let Some(sink) = sink {
                sink.send(phase, &chunk.delta);
            }
            text.push_str(&chunk.delta);
        }
        if let Some(reported) = chunk.usage {
            usage.input_tokens = usage.input_tokens.max(reported.input_tokens);
            usage.output_tokens = usage.output_tokens.max(reported.output_tokens);
        }
    }

    Ok((text, usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_lagging_subscriber_still_gets_every_chunk_in_order() {
        let (sink, mut rx) = StreamSink::channel();
        for i in 0..500 {
            sink.send(StreamPhase::GeneratingSql, &format!("c{} ", i));
        }
        drop(sink);

        let mut seen = String::new();
        while let Some(event) = rx.recv().await {
            seen.push_str(&event.chunk);
        }
        let expected: String = (0..500).map(|i| format!("c{} ", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn send_ignores_a_closed_subscriber() {
        let (sink, rx) = StreamSink::channel();
        drop(rx);
        sink.send(StreamPhase::Analyzing, "ignored");
    }

    #[test]
    fn events_serialize_with_snake_case_phase() {
        let event = StreamEvent {
            phase: StreamPhase::GeneratingSql,
            chunk: "<sql>".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["phase"], "generating_sql");
    }
}
