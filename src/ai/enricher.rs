use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::analyzer::strip_code_fences;
use super::stream::{collect_completion, StreamPhase};
use crate::llm::prompts::Prompts;
use crate::llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider, TokenUsage};

const MAX_TOKENS: u32 = 4000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnEnrichment {
    pub column_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub business_term: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableEnrichment {
    pub table_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnEnrichment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaEnrichment {
    #[serde(default)]
    pub tables: Vec<TableEnrichment>,
}

/// Asks the model for business descriptions of discovered tables and columns.
pub struct SchemaEnricher {
    provider: Arc<dyn LlmProvider>,
    prompts: Arc<Prompts>,
}

impl SchemaEnricher {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: Arc<Prompts>) -> Self {
        Self { provider, prompts }
    }

    pub async fn enrich(&self, schema_info: &str) -> Result<(SchemaEnrichment, TokenUsage), LlmError> {
        let request = CompletionRequest {
            system: self.prompts.schema_analyst_system().to_string(),
            messages: vec![ChatMessage::user(self.prompts.schema_enrichment(schema_info)?)],
            max_tokens: MAX_TOKENS,
        };

        let (text, usage) =
            collect_completion(self.provider.as_ref(), &request, None, StreamPhase::Analyzing).await?;
        let enrichment = parse_enrichment(&text);
        info!("Schema enrichment described {} tables", enrichment.tables.len());
        Ok((enrichment, usage))
    }
}

pub fn parse_enrichment(text: &str) -> SchemaEnrichment {
    match serde_json::from_str(strip_code_fences(text)) {
        Ok(enrichment) => enrichment,
        Err(e) => {
            warn!("Could not parse schema enrichment: {}", e);
            SchemaEnrichment::default()
        }
    }
}
