use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - everything lives under /api
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Chat pipeline
            .route("/chat/message", post(handlers::chat::send_message))
            .route("/chat/stream", post(handlers::chat::stream_message))
            .route("/chat/sessions/{session_id}/messages", get(handlers::chat::list_messages))

            // Organizations and budgets
            .route("/orgs/{org_id}", put(handlers::api::upsert_organization))
            .route("/orgs/{org_id}/budget", get(handlers::api::budget_status))

            // Connections and schema
            .route(
                "/connections",
                get(handlers::api::list_connections).post(handlers::api::create_connection),
            )
            .route("/connections/{id}/test", post(handlers::api::test_connection))
            .route("/connections/{id}/schema", get(handlers::api::get_schema))
            .route("/connections/{id}/schema/refresh", post(handlers::api::refresh_schema))

            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
