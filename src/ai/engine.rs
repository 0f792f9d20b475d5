//! The per-turn pipeline: question -> SQL -> validated, cached execution ->
//! insight and chart, with one repair attempt and token accounting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::analyzer::Analyzer;
use super::chart::ChartConfig;
use super::conversation::{ConversationProvider, ConversationTurn};
use super::schema_context::SchemaProvider;
use super::sql_generator::{SqlDraft, SqlGenerator};
use super::stream::StreamSink;
use super::validator::SqlSafetyValidator;
use crate::budget::{BudgetError, TokenBudgetGuard};
use crate::cache::{cache_key, CacheProvider};
use crate::config::AppConfig;
use crate::connectors::QueryResult;
use crate::db::DbError;
use crate::llm::prompts::Prompts;
use crate::llm::{LlmProvider, TokenUsage};
use crate::query::{ConnectionRef, QueryLimits, QueryRunner};

const BUDGET_EXCEEDED_MESSAGE: &str = "Your organization has reached its monthly AI token budget. \
     Please contact your administrator to upgrade the plan or wait for the budget to reset.";
const NON_DATA_FALLBACK: &str = "I can only answer questions about your data.";
const UNKNOWN_CONNECTION_MESSAGE: &str = "I couldn't find that data connection. Please pick one of your connections.";
const UNAVAILABLE_MESSAGE: &str = "Sorry, I couldn't process that question right now. Please try again in a moment.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub connection_id: String,
    pub session_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
}

/// The first rows of a result, as shown to the user and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

impl ResultPreview {
    pub fn of(result: &QueryResult, max_rows: usize) -> Self {
        let rows: Vec<Vec<Value>> = result.rows.iter().take(max_rows).cloned().collect();
        Self {
            columns: result.columns.clone(),
            row_count: rows.len(),
            truncated: result.rows.len() > max_rows,
            rows,
        }
    }
}

/// Terminal output of a turn. Failures use the same shape with
/// `error_message` set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub context_summary: Option<String>,
    pub generated_sql: Option<String>,
    pub query_result_preview: Option<ResultPreview>,
    pub full_result_row_count: Option<usize>,
    pub chart_config: Option<ChartConfig>,
    pub execution_time_ms: Option<u64>,
    pub token_usage: TokenUsage,
    pub error_message: Option<String>,
    pub session_id: String,
    pub message_id: String,
}

impl ChatResponse {
    fn reply(session_id: &str, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            context_summary: None,
            generated_sql: None,
            query_result_preview: None,
            full_result_row_count: None,
            chart_config: None,
            execution_time_ms: None,
            token_usage: TokenUsage::default(),
            error_message: None,
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn failure(session_id: &str, content: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::reply(session_id, content)
        }
    }

    fn with_sql(mut self, sql: &str) -> Self {
        self.generated_sql = Some(sql.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub query: QueryLimits,
    pub preview_rows: usize,
    pub history_turns: usize,
    pub cache_ttl: Duration,
}

impl From<&AppConfig> for EngineLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            query: QueryLimits::from(&config.query),
            preview_rows: config.query.preview_rows,
            history_turns: config.query.history_turns,
            cache_ttl: config.cache.ttl(),
        }
    }
}

/// Context shared by the steps of one turn.
struct Turn<'a> {
    request: &'a ChatRequest,
    target: ConnectionRef,
    schema_context: String,
    history: Vec<ConversationTurn>,
    sink: Option<&'a StreamSink>,
}

pub struct AiEngine {
    schema: Arc<dyn SchemaProvider>,
    runner: Arc<dyn QueryRunner>,
    cache: Arc<dyn CacheProvider>,
    conversation: Arc<dyn ConversationProvider>,
    budget: Option<Arc<TokenBudgetGuard>>,
    prompts: Arc<Prompts>,
    validator: SqlSafetyValidator,
    generator: SqlGenerator,
    analyzer: Analyzer,
    limits: EngineLimits,
}

impl AiEngine {
    pub fn new(
        schema: Arc<dyn SchemaProvider>,
        runner: Arc<dyn QueryRunner>,
        cache: Arc<dyn CacheProvider>,
        conversation: Arc<dyn ConversationProvider>,
        provider: Arc<dyn LlmProvider>,
        prompts: Arc<Prompts>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            schema,
            runner,
            cache,
            conversation,
            budget: None,
            generator: SqlGenerator::new(Arc::clone(&provider), Arc::clone(&prompts)),
            analyzer: Analyzer::new(provider, Arc::clone(&prompts)),
            prompts,
            validator: SqlSafetyValidator::new(),
            limits,
        }
    }

    pub fn with_budget(mut self, guard: Arc<TokenBudgetGuard>) -> Self {
        self.budget = Some(guard);
        self
    }

    /// Runs one turn to completion. Never fails: every terminal condition is
    /// a `ChatResponse`, and the tokens of every model call made along the
    /// way are charged to the organization.
    pub async fn process_message(&self, request: ChatRequest, sink: Option<StreamSink>) -> ChatResponse {
        info!(
            "Processing message for session {} on connection {}",
            request.session_id, request.connection_id
        );
        let mut usage = TokenUsage::default();
        let mut response = self.run(&request, sink.as_ref(), &mut usage).await;

        if let (Some(guard), Some(org_id)) = (&self.budget, request.org_id.as_deref()) {
            guard.record_usage(org_id, usage).await;
        }
        response.token_usage = usage;
        response
    }

    async fn run(&self, request: &ChatRequest, sink: Option<&StreamSink>, usage: &mut TokenUsage) -> ChatResponse {
        let session_id = request.session_id.as_str();

        if let (Some(guard), Some(org_id)) = (&self.budget, request.org_id.as_deref()) {
            match guard.check_budget(org_id).await {
                Ok(()) => {}
                Err(e @ BudgetError::Exceeded { .. }) => {
                    info!("Budget exhausted for org {}", org_id);
                    return ChatResponse::failure(session_id, BUDGET_EXCEEDED_MESSAGE, e.to_string());
                }
                Err(e) => warn!("Budget check for org {} failed: {}", org_id, e),
            }
        }

        let schema_context = match self
            .schema
            .get_schema_context(&request.connection_id, request.org_id.as_deref())
            .await
        {
            Ok(context) => context,
            Err(DbError::NotFound(message)) => {
                warn!("Rejected turn for session {}: {}", session_id, message);
                return ChatResponse::failure(session_id, UNKNOWN_CONNECTION_MESSAGE, message);
            }
            Err(e) => {
                error!("Failed to load schema for {}: {}", request.connection_id, e);
                return ChatResponse::failure(session_id, UNAVAILABLE_MESSAGE, e.to_string());
            }
        };
        let history = match self
            .conversation
            .get_condensed_history(session_id, self.limits.history_turns)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                error!("Failed to load history for session {}: {}", session_id, e);
                return ChatResponse::failure(session_id, UNAVAILABLE_MESSAGE, e.to_string());
            }
        };

        let turn = Turn {
            request,
            target: ConnectionRef {
                connection_id: request.connection_id.clone(),
                org_id: request.org_id.clone(),
            },
            schema_context,
            history,
            sink,
        };
        self.answer(&turn, usage).await
    }

    async fn answer(&self, turn: &Turn<'_>, usage: &mut TokenUsage) -> ChatResponse {
        let session_id = turn.request.session_id.as_str();

        let generated = match self
            .generator
            .generate(&turn.request.message, &turn.schema_context, &turn.history, turn.sink)
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                error!("SQL generation failed: {}", e);
                return ChatResponse::failure(session_id, UNAVAILABLE_MESSAGE, e.to_string());
            }
        };
        *usage += generated.token_usage;

        let sql = match &generated.draft {
            SqlDraft::Statement(sql) => sql.clone(),
            SqlDraft::CannotAnswer | SqlDraft::NotDataQuery => {
                info!("Model declined to write SQL: {:?}", generated.draft);
                let content = if generated.reasoning.trim().is_empty() {
                    NON_DATA_FALLBACK.to_string()
                } else {
                    generated.reasoning
                };
                return ChatResponse::reply(session_id, content);
            }
        };

        let validation = self.validator.validate(&sql);
        let normalized = match (validation.is_safe, validation.normalized_sql) {
            (true, Some(normalized)) => normalized,
            _ => {
                let reason = validation.reason.unwrap_or_default();
                warn!("Generated SQL blocked: {}", reason);
                return ChatResponse::failure(
                    session_id,
                    format!(
                        "I generated a query but it was blocked for safety: {}. \
                         I can only run read-only queries. Could you rephrase?",
                        reason
                    ),
                    reason,
                )
                .with_sql(&sql);
            }
        };

        let key = cache_key(&turn.target.connection_id, &normalized);
        let (executed_sql, result) = match self.cache.get(&key).await {
            Some(cached) => {
                info!("Cache hit for query {}...", &key[..16]);
                (normalized, cached)
            }
            None => match self.execute_with_repair(turn, normalized, usage).await {
                Ok(executed) => executed,
                Err(response) => return response,
            },
        };

        let analysis = match self
            .analyzer
            .analyze(&turn.request.message, &executed_sql, &result, turn.sink)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                error!("Analysis failed: {}", e);
                let mut response = ChatResponse::failure(
                    session_id,
                    "I ran your query but couldn't analyze the results. Here is the raw data.",
                    e.to_string(),
                )
                .with_sql(&executed_sql);
                self.attach_result(&mut response, &result);
                response.chart_config = Some(ChartConfig::results_table());
                return response;
            }
        };
        *usage += analysis.token_usage;

        let mut response = ChatResponse::reply(session_id, analysis.insight).with_sql(&executed_sql);
        response.context_summary = Some(analysis.context_summary);
        response.chart_config = Some(analysis.chart_config);
        self.attach_result(&mut response, &result);
        info!(
            "Answered with {} rows and a {} chart",
            result.row_count,
            response.chart_config.as_ref().map_or("table", ChartConfig::chart_type)
        );
        response
    }

    /// Executes on a cache miss. A failed execution gets exactly one repair
    /// attempt; a result is cached only under the SQL that produced it.
    async fn execute_with_repair(
        &self,
        turn: &Turn<'_>,
        sql: String,
        usage: &mut TokenUsage,
    ) -> Result<(String, QueryResult), ChatResponse> {
        let result = self.runner.execute(&turn.target, &sql, self.limits.query, true).await;
        let (sql, result) = match result.error.clone() {
            None => (sql, result),
            Some(error) => {
                warn!("Query failed, attempting one repair: {}", error);
                match self.repair(turn, &error, usage).await {
                    Some(repaired) => {
                        let retried = self.runner.execute(&turn.target, &repaired, self.limits.query, true).await;
                        (repaired, retried)
                    }
                    None => (sql, result),
                }
            }
        };

        if let Some(error) = &result.error {
            return Err(ChatResponse::failure(
                &turn.request.session_id,
                format!("I ran into an issue querying your data: {}. Could you try rephrasing?", error),
                error.clone(),
            )
            .with_sql(&sql));
        }

        let key = cache_key(&turn.target.connection_id, &sql);
        self.cache.set(&key, &result, self.limits.cache_ttl).await;
        Ok((sql, result))
    }

    /// Asks the model once for corrected SQL. Returns the normalized
    /// statement only if it is a safe query.
    async fn repair(&self, turn: &Turn<'_>, error: &str, usage: &mut TokenUsage) -> Option<String> {
        let prompt = match self.prompts.sql_repair(&turn.request.message, error) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not build repair prompt: {}", e);
                return None;
            }
        };
        let repaired = match self
            .generator
            .generate(&prompt, &turn.schema_context, &turn.history, turn.sink)
            .await
        {
            Ok(repaired) => repaired,
            Err(e) => {
                warn!("Repair generation failed: {}", e);
                return None;
            }
        };
        *usage += repaired.token_usage;

        let sql = repaired.draft.statement()?;
        let validation = self.validator.validate(sql);
        if !validation.is_safe {
            warn!("Repaired SQL blocked: {}", validation.reason.unwrap_or_default());
            return None;
        }
        debug!("Repaired SQL: {:?}", validation.normalized_sql);
        validation.normalized_sql
    }

    fn attach_result(&self, response: &mut ChatResponse, result: &QueryResult) {
        response.query_result_preview = Some(ResultPreview::of(result, self.limits.preview_rows));
        response.full_result_row_count = Some(result.row_count);
        response.execution_time_ms = Some(result.execution_time_ms);
    }
}
