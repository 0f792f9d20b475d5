use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::Serialize;
use serde_json::Value;

use super::{from_millis, new_id, to_millis, AppDb, DbError};
use crate::ai::conversation::{condense, ConversationProvider, ConversationTurn, StoredMessage};
use crate::llm::Role;

/// The assistant side of one exchange, as persisted after the response.
#[derive(Debug, Clone, Default)]
pub struct AssistantReply {
    pub content: String,
    pub context_summary: Option<String>,
    pub generated_sql: Option<String>,
    pub chart_config: Option<Value>,
    pub query_result_preview: Option<Value>,
    pub full_result_row_count: Option<usize>,
    pub execution_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRecord {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub context_summary: Option<String>,
    pub generated_sql: Option<String>,
    pub chart_config: Option<Value>,
    pub full_result_row_count: Option<u64>,
    pub execution_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

fn parse_role(value: &str) -> Role {
    if value == "assistant" { Role::Assistant } else { Role::User }
}

pub struct ChatStore {
    db: AppDb,
}

impl ChatStore {
    pub fn new(db: AppDb) -> Self {
        Self { db }
    }

    /// Both rows of a turn are written together or not at all.
    pub async fn save_exchange(&self, session_id: &str, user_message: &str, reply: AssistantReply) -> Result<(), DbError> {
        let session_id = session_id.to_string();
        let user_message = user_message.to_string();

        self.db
            .transaction(move |conn| {
                let now = to_millis(Utc::now());
                insert_user_message(conn, &session_id, &user_message, now)?;
                insert_assistant_message(conn, &session_id, &reply, now)
            })
            .await
    }

    /// Full session transcript, oldest first.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessageRecord>, DbError> {
        let session_id = session_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, role, content, context_summary, generated_sql, chart_config,
                            full_result_row_count, execution_time_ms, error_message, created_at
                     FROM chat_messages WHERE session_id = ? ORDER BY seq",
                )?;
                let records = stmt
                    .query_map([&session_id], |row| {
                        let role: String = row.get(1)?;
                        let chart: Option<String> = row.get(5)?;
                        Ok(ChatMessageRecord {
                            id: row.get(0)?,
                            role: parse_role(&role),
                            content: row.get(2)?,
                            context_summary: row.get(3)?,
                            generated_sql: row.get(4)?,
                            chart_config: chart.and_then(|text| serde_json::from_str(&text).ok()),
                            full_result_row_count: row.get::<_, Option<i64>>(6)?.and_then(|n| u64::try_from(n).ok()),
                            execution_time_ms: row.get::<_, Option<i64>>(7)?.and_then(|n| u64::try_from(n).ok()),
                            error_message: row.get(8)?,
                            created_at: from_millis(row.get(9)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }
}

#[async_trait]
impl ConversationProvider for ChatStore {
    async fn get_condensed_history(&self, session_id: &str, max_turns: usize) -> Result<Vec<ConversationTurn>, DbError> {
        let session_id = session_id.to_string();
        let limit = i64::try_from(max_turns.saturating_mul(2)).unwrap_or(i64::MAX);
        let mut messages = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT role, content, context_summary FROM chat_messages
                     WHERE session_id = ? ORDER BY seq DESC LIMIT ?",
                )?;
                let messages = stmt
                    .query_map(params![session_id, limit], |row| {
                        let role: String = row.get(0)?;
                        Ok(StoredMessage {
                            role: parse_role(&role),
                            content: row.get(1)?,
                            context_summary: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(messages)
            })
            .await?;
        messages.reverse();
        Ok(condense(&messages))
    }
}

fn insert_user_message(conn: &Connection, session_id: &str, content: &str, now: i64) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, role, content, created_at) VALUES (?, ?, 'user', ?, ?)",
        params![new_id(), session_id, content, now],
    )?;
    Ok(())
}

fn insert_assistant_message(conn: &Connection, session_id: &str, reply: &AssistantReply, now: i64) -> Result<(), DbError> {
    let chart_config = reply.chart_config.as_ref().map(serde_json::to_string).transpose()?;
    let preview = reply.query_result_preview.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO chat_messages
            (id, session_id, role, content, context_summary, generated_sql, chart_config,
             query_result_preview, full_result_row_count, execution_time_ms, error_message, created_at)
         VALUES (?, ?, 'assistant', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            new_id(),
            session_id,
            reply.content,
            reply.context_summary,
            reply.generated_sql,
            chart_config,
            preview,
            reply.full_result_row_count.and_then(|n| i64::try_from(n).ok()),
            reply.execution_time_ms.and_then(|n| i64::try_from(n).ok()),
            reply.error_message,
            now
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(content: &str, summary: Option<&str>) -> AssistantReply {
        AssistantReply {
            content: content.to_string(),
            context_summary: summary.map(str::to_string),
            generated_sql: Some("SELECT 1".to_string()),
            chart_config: Some(serde_json::json!({"chart_type": "table", "title": "Results"})),
            full_result_row_count: Some(1),
            execution_time_ms: Some(3),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn history_is_recent_condensed_and_oldest_first() {
        let store = ChatStore::new(AppDb::in_memory().unwrap());
        for i in 1..=4 {
            store
                .save_exchange(
                    "s1",
                    &format!("question {}", i),
                    reply(&format!("long answer {}", i), Some(&format!("summary {}", i))),
                )
                .await
                .unwrap();
        }
        store.save_exchange("s2", "elsewhere", reply("x", None)).await.unwrap();

        let turns = store.get_condensed_history("s1", 2).await.unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "question 3",
                "[context_summary]: summary 3",
                "question 4",
                "[context_summary]: summary 4"
            ]
        );
    }

    #[tokio::test]
    async fn failed_assistant_write_drops_the_user_turn_too() {
        let store = ChatStore::new(AppDb::in_memory().unwrap());
        let failed = store
            .db
            .transaction(|conn| {
                insert_user_message(conn, "s1", "how many orders?", 1)?;
                Err::<(), _>(DbError::Invalid("assistant insert failed".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(store.list_messages("s1").await.unwrap().is_empty());

        store.save_exchange("s1", "how many orders?", reply("42.", None)).await.unwrap();
        assert_eq!(store.list_messages("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transcript_keeps_full_content() {
        let store = ChatStore::new(AppDb::in_memory().unwrap());
        store.save_exchange("s1", "how many orders?", reply("There are 42 orders.", None)).await.unwrap();

        let messages = store.list_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "There are 42 orders.");
        assert_eq!(messages[1].chart_config.as_ref().unwrap()["chart_type"], "table");

        // assistant turns without a summary drop out of the prompt history
        let turns = store.get_condensed_history("s1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
    }
}
