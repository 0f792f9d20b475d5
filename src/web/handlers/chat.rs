use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, warn};

use super::org_id;
use crate::ai::{ChatRequest, ChatResponse, StreamSink};
use crate::db::chat_store::{AssistantReply, ChatMessageRecord};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub connection_id: String,
    pub session_id: Option<String>,
}

fn chat_request(body: SendMessageRequest, headers: &HeaderMap) -> Result<ChatRequest, (StatusCode, String)> {
    if body.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message must not be empty".to_string()));
    }
    Ok(ChatRequest {
        message: body.message,
        connection_id: body.connection_id,
        session_id: body
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        org_id: org_id(headers),
    })
}

/// Runs the turn, then persists the exchange. History is only written once
/// the terminal response exists.
async fn run_turn(state: &AppState, request: ChatRequest, sink: Option<StreamSink>) -> ChatResponse {
    let session_id = request.session_id.clone();
    let message = request.message.clone();
    let response = state.engine.process_message(request, sink).await;

    let reply = AssistantReply {
        content: response.content.clone(),
        context_summary: response.context_summary.clone(),
        generated_sql: response.generated_sql.clone(),
        chart_config: response
            .chart_config
            .as_ref()
            .and_then(|chart| serde_json::to_value(chart).ok()),
        query_result_preview: response
            .query_result_preview
            .as_ref()
            .and_then(|preview| serde_json::to_value(preview).ok()),
        full_result_row_count: response.full_result_row_count,
        execution_time_ms: response.execution_time_ms,
        error_message: response.error_message.clone(),
    };
    if let Err(e) = state.chat_store.save_exchange(&session_id, &message, reply).await {
        warn!("Failed to save chat history for session {}: {}", session_id, e);
    }
    response
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let request = chat_request(body, &headers)?;
    Ok(Json(run_turn(&state, request, None).await))
}

/// `stream` events carry `{phase, chunk}` while the model writes; a single
/// `response` event carries the final `ChatResponse`.
pub async fn stream_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, String)> {
    let request = chat_request(body, &headers)?;
    let (sink, rx) = StreamSink::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let response = run_turn(&state, request, Some(sink)).await;
        if done_tx.send(response).is_err() {
            warn!("Client disconnected before the response was ready");
        }
    });

    // the chunk stream ends when the turn drops its sink
    let chunks = UnboundedReceiverStream::new(rx).map(|event| Event::default().event("stream").json_data(event));
    let done = stream::once(async move {
        match done_rx.await {
            Ok(response) => Event::default().event("response").json_data(response),
            Err(_) => {
                error!("Chat turn ended without a response");
                Ok(Event::default().event("error").data("turn aborted"))
            }
        }
    });

    Ok(Sse::new(chunks.chain(done)).keep_alive(KeepAlive::default()))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ChatMessageRecord>>, (StatusCode, String)> {
    state.chat_store.list_messages(&session_id).await.map(Json).map_err(|e| {
        error!("Failed to load messages for session {}: {}", session_id, e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load messages".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn body(message: &str, session_id: Option<&str>) -> SendMessageRequest {
        SendMessageRequest {
            message: message.to_string(),
            connection_id: "conn-1".to_string(),
            session_id: session_id.map(str::to_string),
        }
    }

    #[test]
    fn requests_pick_up_org_and_session() {
        let mut headers = HeaderMap::new();
        headers.insert("x-org-id", HeaderValue::from_static("acme"));

        let request = chat_request(body("top customers", Some("s-9")), &headers).unwrap();
        assert_eq!(request.org_id.as_deref(), Some("acme"));
        assert_eq!(request.session_id, "s-9");

        let fresh = chat_request(body("top customers", None), &HeaderMap::new()).unwrap();
        assert!(uuid::Uuid::parse_str(&fresh.session_id).is_ok());
        assert_eq!(fresh.org_id, None);
    }

    #[test]
    fn blank_messages_are_rejected() {
        let err = chat_request(body("   ", None), &HeaderMap::new()).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
