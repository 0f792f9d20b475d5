use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::chart::ChartConfig;
use super::stream::{collect_completion, StreamPhase, StreamSink};
use crate::connectors::QueryResult;
use crate::llm::prompts::Prompts;
use crate::llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider, TokenUsage};

const MAX_TOKENS: u32 = 1500;
const PROMPT_ROWS: usize = 50;
const PREVIEW_TABLE_ROWS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub insight: String,
    pub context_summary: String,
    pub chart_config: ChartConfig,
    pub token_usage: TokenUsage,
}

/// Writes the narrative and picks the chart in a single model call.
pub struct Analyzer {
    provider: Arc<dyn LlmProvider>,
    prompts: Arc<Prompts>,
}

impl Analyzer {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: Arc<Prompts>) -> Self {
        Self { provider, prompts }
    }

    pub async fn analyze(
        &self,
        user_message: &str,
        sql: &str,
        result: &QueryResult,
        sink: Option<&StreamSink>,
    ) -> Result<AnalysisResult, LlmError> {
        let rows = &result.rows[..result.rows.len().min(PROMPT_ROWS)];
        let preview = format_preview(&result.columns, rows);

        let prompt = self.prompts.analyze_and_visualize(
            user_message,
            sql,
            result.row_count,
            &result.columns,
            &preview,
        )?;
        let request = CompletionRequest {
            system: self.prompts.analyst_system().to_string(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: MAX_TOKENS,
        };

        info!("Analyzing {} result rows with {}", result.row_count, self.provider.name());
        let (text, token_usage) =
            collect_completion(self.provider.as_ref(), &request, sink, StreamPhase::Analyzing).await?;

        Ok(parse_analysis(&text, token_usage))
    }
}

fn format_preview(columns: &[String], rows: &[Vec<Value>]) -> String {
    if rows.is_empty() {
        return "(empty result set)".to_string();
    }

    let header = columns.join(" | ");
    let mut lines = vec![header.clone(), "-".repeat(header.len())];
    for row in rows.iter().take(PREVIEW_TABLE_ROWS) {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        lines.push(cells.join(" | "));
    }
    if rows.len() > PREVIEW_TABLE_ROWS {
        lines.push(format!("... ({} more rows)", rows.len() - PREVIEW_TABLE_ROWS));
    }
    lines.join("\n")
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn strip_code_fences(text: &str) -> &str {
    let mut cleaned = text.trim();
    if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest,
        };
    }
    if let Some(rest) = cleaned.trim_end().strip_suffix("```") {
        cleaned = rest.trim_end();
    }
    cleaned
}

/// Never fails: text that is not the expected JSON object becomes the
/// insight itself, shown as a plain results table.
pub fn parse_analysis(text: &str, token_usage: TokenUsage) -> AnalysisResult {
    let parsed = match serde_json::from_str::<Value>(strip_code_fences(text)) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(
                "Failed to parse analysis response as JSON: {}",
                text.chars().take(200).collect::<String>()
            );
            return AnalysisResult {
                insight: text.to_string(),
                context_summary: "Analysis provided as text.".to_string(),
                chart_config: ChartConfig::results_table(),
                token_usage,
            };
        }
    };

    let insight = parsed
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("Analysis complete.")
        .to_string();
    let context_summary = parsed
        .get("context_summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let chart_config = parsed
        .get("chart_config")
        .cloned()
        .and_then(|config| match serde_json::from_value::<ChartConfig>(config) {
            Ok(chart) => Some(chart),
            Err(e) => {
                warn!("Unusable chart recommendation, falling back to table: {}", e);
                None
            }
        })
        .unwrap_or_else(ChartConfig::results_table);

    AnalysisResult {
        insight,
        context_summary,
        chart_config,
        token_usage,
    }
}
