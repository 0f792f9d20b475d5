//! Line framing for streamed LLM responses.
//!
//! Network chunks do not line up with protocol lines: one chunk may hold
//! several events, and a single JSON payload (or a multi-byte character) may
//! be split across two chunks. Bytes are buffered until a full line is
//! available. Server-sent-event providers then strip the `data:` prefix with
//! [`sse_event`]; NDJSON providers use the lines as-is.

use bytes::Bytes;
use futures_util::stream::unfold;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::mem;
use std::pin::Pin;

use super::LlmError;

/// A parsed server-sent event line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// The payload of a `data:` line
    Data(String),
    /// The `[DONE]` terminator used by OpenAI-compatible APIs
    Done,
}

#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the
    /// terminator. Blank lines are skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let line = mem::replace(&mut self.buffer, rest);
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_end_matches(['\n', '\r']);
            if !trimmed.trim().is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        lines
    }

    /// Returns the trailing partial line once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&remaining);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Interprets one line of an SSE stream. `event:`, `id:`, `retry:` and
/// comment lines yield `None`.
pub fn sse_event(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}

struct LineState<S> {
    bytes: Pin<Box<S>>,
    buffer: LineBuffer,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turns a raw byte stream (e.g. `reqwest::Response::bytes_stream`) into a
/// stream of complete lines.
pub fn line_stream<S, E>(bytes: S) -> impl Stream<Item = Result<String, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    let state = LineState {
        bytes: Box::pin(bytes),
        buffer: LineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.buffer.feed(&chunk);
                    state.pending.extend(lines);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(LlmError::ConnectionError(format!("stream interrupted: {}", e))),
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    if let Some(line) = state.buffer.flush() {
                        state.pending.push_back(line);
                    }
                }
            }
        }
    })
}
