use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::org_id;
use crate::ai::schema_context::SchemaContext;
use crate::budget::{BudgetError, BudgetStatus};
use crate::connectors::ConnectorError;
use crate::db::connections::{ConnectionRecord, NewConnection};
use crate::db::organizations::{Organization, OrganizationUpdate};
use crate::db::schema_manager::DiscoverySummary;
use crate::db::DbError;
use crate::web::state::AppState;

type ApiError = (StatusCode, String);

fn internal(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
}

fn connector_error(e: ConnectorError) -> ApiError {
    match e {
        ConnectorError::Connection(message) if message.ends_with("not found") => (StatusCode::NOT_FOUND, message),
        ConnectorError::Config(message) => (StatusCode::BAD_REQUEST, message),
        other => (StatusCode::BAD_GATEWAY, other.to_string()),
    }
}

// Organizations

pub async fn budget_status(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
) -> Result<Json<BudgetStatus>, ApiError> {
    match state.budget.status(&org_id).await {
        Ok(status) => Ok(Json(status)),
        Err(BudgetError::NotFound(_)) => Err((StatusCode::NOT_FOUND, format!("Organization {} not found", org_id))),
        Err(e) => Err(internal("Failed to load budget", e)),
    }
}

pub async fn upsert_organization(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Json(update): Json<OrganizationUpdate>,
) -> Result<Json<Organization>, ApiError> {
    match state.organizations.upsert(&org_id, update).await {
        Ok(org) => Ok(Json(org)),
        Err(DbError::Invalid(message)) => Err((StatusCode::BAD_REQUEST, message)),
        Err(e) => Err(internal("Failed to save organization", e)),
    }
}

// Connections

pub async fn create_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new): Json<NewConnection>,
) -> Result<(StatusCode, Json<ConnectionRecord>), ApiError> {
    match state.connections.create(org_id(&headers).as_deref(), new).await {
        Ok(record) => Ok((StatusCode::CREATED, Json(record))),
        Err(DbError::Invalid(message)) => Err((StatusCode::BAD_REQUEST, message)),
        Err(e) => Err(internal("Failed to register connection", e)),
    }
}

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectionRecord>>, ApiError> {
    state
        .connections
        .list_for_org(org_id(&headers).as_deref())
        .await
        .map(Json)
        .map_err(|e| internal("Failed to list connections", e))
}

#[derive(Debug, Serialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub error: Option<String>,
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConnectionTest>, ApiError> {
    let connector = state
        .connection_manager
        .get_connector(&id, org_id(&headers).as_deref())
        .await;
    let outcome = match connector {
        Ok(connector) => {
            let result = connector.test_connection().await;
            connector.close().await;
            result
        }
        Err(e @ ConnectorError::Connection(_)) if e.to_string().ends_with("not found") => {
            return Err(connector_error(e));
        }
        Err(e) => Err(e),
    };

    Ok(Json(match outcome {
        Ok(()) => ConnectionTest { ok: true, error: None },
        Err(e) => {
            warn!("Connection test for {} failed: {}", id, e);
            ConnectionTest {
                ok: false,
                error: Some(e.to_string()),
            }
        }
    }))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SchemaContext>, ApiError> {
    let owned = state
        .connections
        .get_for_org(&id, org_id(&headers).as_deref())
        .await
        .map_err(|e| internal("Failed to load connection", e))?;
    if owned.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Connection {} not found", id)));
    }
    state
        .schema_manager
        .load_context(&id)
        .await
        .map(Json)
        .map_err(|e| internal("Failed to load schema", e))
}

#[derive(Debug, Deserialize)]
pub struct RefreshParams {
    #[serde(default)]
    pub enrich: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    #[serde(flatten)]
    pub discovered: DiscoverySummary,
    pub enriched_columns: usize,
}

/// Re-discovers the schema and optionally asks the model to describe it.
/// Enrichment tokens are charged like any other model call.
pub async fn refresh_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<RefreshOutcome>, ApiError> {
    let org = org_id(&headers);
    let connector = state
        .connection_manager
        .get_connector(&id, org.as_deref())
        .await
        .map_err(connector_error)?;

    let discovered = state.schema_manager.discover(&id, connector.as_ref()).await;
    connector.close().await;
    let discovered = discovered.map_err(|e| match e {
        DbError::Connector(e) => connector_error(e),
        other => internal("Schema discovery failed", other),
    })?;
    if let Err(e) = state.connections.mark_synced(&id).await {
        warn!("Failed to mark {} as synced: {}", id, e);
    }

    let mut enriched_columns = 0;
    if params.enrich {
        if let Some(org) = org.as_deref() {
            if let Err(e) = state.budget.check_budget(org).await {
                return Err((StatusCode::PAYMENT_REQUIRED, e.to_string()));
            }
        }

        let schema_info = state
            .schema_manager
            .load_context(&id)
            .await
            .map_err(|e| internal("Failed to load schema", e))?
            .render();
        let (enrichment, usage) = state
            .enricher
            .enrich(&schema_info)
            .await
            .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
        if let Some(org) = org.as_deref() {
            state.budget.record_usage(org, usage).await;
        }
        enriched_columns = state
            .schema_manager
            .apply_enrichment(&id, enrichment)
            .await
            .map_err(|e| internal("Failed to store enrichment", e))?;
        info!("Enriched {} columns for connection {}", enriched_columns, id);
    }

    Ok(Json(RefreshOutcome {
        discovered,
        enriched_columns,
    }))
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub llm_backend: String,
    pub cache_backend: String,
    pub budget_enforced: bool,
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        llm_backend: state.llm_backend.clone(),
        cache_backend: state.config.cache.backend.clone(),
        budget_enforced: state.config.budget.enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_connections_map_to_404() {
        let (status, message) = connector_error(ConnectorError::Connection("Connection c1 not found".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message, "Connection c1 not found");

        let (status, _) = connector_error(ConnectorError::Config("host is required for postgres".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = connector_error(ConnectorError::Connection("refused".to_string()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
