use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use super::conversation::ConversationTurn;
use super::stream::{collect_completion, StreamPhase, StreamSink};
use crate::llm::prompts::Prompts;
use crate::llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider, TokenUsage};

const MAX_TOKENS: u32 = 2000;

pub const CANNOT_ANSWER: &str = "CANNOT_ANSWER";
pub const NOT_DATA_QUERY: &str = "NOT_DATA_QUERY";

static SQL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<sql>(.*?)</sql>").expect("valid regex"));
static SQL_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```sql\s*(.*?)```").expect("valid regex"));
static SELECT_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)```\s*(SELECT.*?)```").expect("valid regex"));
static REASONING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<reasoning>(.*?)</reasoning>").expect("valid regex"));

/// What the model produced in place of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlDraft {
    Statement(String),
    CannotAnswer,
    NotDataQuery,
}

impl SqlDraft {
    fn from_text(sql: &str) -> Self {
        match sql.trim() {
            CANNOT_ANSWER => SqlDraft::CannotAnswer,
            NOT_DATA_QUERY => SqlDraft::NotDataQuery,
            "" => SqlDraft::CannotAnswer,
            other => SqlDraft::Statement(other.to_string()),
        }
    }

    pub fn statement(&self) -> Option<&str> {
        match self {
            SqlDraft::Statement(sql) => Some(sql),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub draft: SqlDraft,
    pub reasoning: String,
    pub token_usage: TokenUsage,
}

pub struct SqlGenerator {
    provider: Arc<dyn LlmProvider>,
    prompts: Arc<Prompts>,
}

impl SqlGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, prompts: Arc<Prompts>) -> Self {
        Self { provider, prompts }
    }

    pub async fn generate(
        &self,
        user_message: &str,
        schema_context: &str,
        history: &[ConversationTurn],
        sink: Option<&StreamSink>,
    ) -> Result<GeneratedSql, LlmError> {
        let mut messages: Vec<ChatMessage> = history.iter().map(ConversationTurn::to_message).collect();
        messages.push(ChatMessage::user(user_message));

        let request = CompletionRequest {
            system: self.prompts.sql_generation(schema_context)?,
            messages,
            max_tokens: MAX_TOKENS,
        };

        info!(
            "Generating SQL with {} ({} history turns)",
            self.provider.name(),
            history.len()
        );
        let (text, token_usage) =
            collect_completion(self.provider.as_ref(), &request, sink, StreamPhase::GeneratingSql).await?;

        let draft = extract_sql(&text);
        debug!("Generated SQL draft: {:?}", draft);

        Ok(GeneratedSql {
            draft,
            reasoning: extract_reasoning(&text),
            token_usage,
        })
    }
}

/// Tagged `<sql>` block first, then a ```sql fence, then any fence that
/// starts with SELECT. Anything else cannot be trusted as SQL.
pub fn extract_sql(text: &str) -> SqlDraft {
    [&*SQL_TAG, &*SQL_FENCE, &*SELECT_FENCE]
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| SqlDraft::from_text(m.as_str()))
        .unwrap_or(SqlDraft::CannotAnswer)
}

pub fn extract_reasoning(text: &str) -> String {
    REASONING_TAG
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_sql_tags() {
        let text = "<reasoning>Uses orders.</reasoning>\n<sql>\nSELECT o.id FROM orders o\n</sql>\n```sql\nSELECT 2\n```";
        assert_eq!(
            extract_sql(text),
            SqlDraft::Statement("SELECT o.id FROM orders o".to_string())
        );
        assert_eq!(extract_reasoning(text), "Uses orders.");
    }

    #[test]
    fn falls_back_to_fences() {
        assert_eq!(
            extract_sql("Here you go:\n```sql\nSELECT 1\n```"),
            SqlDraft::Statement("SELECT 1".to_string())
        );
        assert_eq!(
            extract_sql("```\nselect name from users\n```"),
            SqlDraft::Statement("select name from users".to_string())
        );
        // a generic fence that is not a query is not trusted
        assert_eq!(extract_sql("```\nDROP TABLE users\n```"), SqlDraft::CannotAnswer);
    }

    #[test]
    fn recognises_sentinels_and_garbage() {
        assert_eq!(extract_sql("<sql>NOT_DATA_QUERY</sql>"), SqlDraft::NotDataQuery);
        assert_eq!(extract_sql("<sql> CANNOT_ANSWER </sql>"), SqlDraft::CannotAnswer);
        assert_eq!(extract_sql("I am not sure what you mean."), SqlDraft::CannotAnswer);
        assert_eq!(extract_reasoning("no tags"), "");
    }
}
