use async_trait::async_trait;
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ChatStream, CompletionRequest, LlmError, LlmProvider, StreamChunk, TokenUsage};

/// Replays canned completions in order and keeps every request it saw.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<(String, TokenUsage), String>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, text: &str, usage: TokenUsage) -> Self {
        self.replies.lock().unwrap().push_back(Ok((text.to_string(), usage)));
        self
    }

    pub(crate) fn fail(self, message: &str) -> Self {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<ChatStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.replies.lock().unwrap().pop_front();
        let (text, usage) = match next {
            Some(Ok(reply)) => reply,
            Some(Err(message)) => return Err(LlmError::ConnectionError(message)),
            None => return Err(LlmError::ResponseError("no scripted reply left".to_string())),
        };

        // split so consumers see more than one delta
        let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
        let chunks = vec![
            Ok(StreamChunk::text(&text[..mid])),
            Ok(StreamChunk::text(&text[mid..])),
            Ok(StreamChunk::usage(usage)),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}
