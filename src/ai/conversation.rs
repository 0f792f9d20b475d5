use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::DbError;
use crate::llm::{ChatMessage, Role};

/// A stored chat message as the condenser sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub context_summary: Option<String>,
}

/// One turn of condensed history. Assistant turns only ever carry the
/// one-sentence summary, never the full answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::User => ChatMessage::user(self.text.clone()),
            Role::Assistant => ChatMessage::assistant(self.text.clone()),
        }
    }
}

/// Condenses messages (oldest first) into prompt history.
pub fn condense(messages: &[StoredMessage]) -> Vec<ConversationTurn> {
    messages
        .iter()
        .filter_map(|message| match message.role {
            Role::User => Some(ConversationTurn {
                role: Role::User,
                text: message.content.clone(),
            }),
            Role::Assistant => message
                .context_summary
                .as_ref()
                .filter(|summary| !summary.trim().is_empty())
                .map(|summary| ConversationTurn {
                    role: Role::Assistant,
                    text: format!("[context_summary]: {}", summary),
                }),
        })
        .collect()
}

#[async_trait]
pub trait ConversationProvider: Send + Sync {
    /// The most recent `max_turns` condensed turns, oldest first.
    async fn get_condensed_history(
        &self,
        session_id: &str,
        max_turns: usize,
    ) -> Result<Vec<ConversationTurn>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, content: &str, summary: Option<&str>) -> StoredMessage {
        StoredMessage {
            role,
            content: content.to_string(),
            context_summary: summary.map(str::to_string),
        }
    }

    #[test]
    fn assistant_turns_keep_only_the_summary() {
        let turns = condense(&[
            message(Role::User, "top products last quarter", None),
            message(
                Role::Assistant,
                "A long narrative with many numbers...",
                Some("Showed top 10 products by Q4 revenue"),
            ),
            message(Role::User, "and by region?", None),
            message(Role::Assistant, "Budget exceeded.", None),
        ]);

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "top products last quarter");
        assert_eq!(
            turns[1].text,
            "[context_summary]: Showed top 10 products by Q4 revenue"
        );
        assert!(!turns.iter().any(|t| t.text.contains("narrative")));
        assert_eq!(turns[2].role, Role::User);
    }
}
