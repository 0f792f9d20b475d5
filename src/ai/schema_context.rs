//! Prompt-ready description of a connection's schema, built only from
//! metadata persisted by schema discovery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::DbError;

const MAX_RENDERED_SAMPLES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub foreign_key_target: Option<String>,
    pub business_term: Option<String>,
    pub description: Option<String>,
    pub sample_values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub description: Option<String>,
    pub row_count: Option<u64>,
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableDescription>,
}

impl SchemaContext {
    pub fn render(&self) -> String {
        if self.tables.is_empty() {
            return "No schema metadata available. Please refresh the schema.".to_string();
        }

        self.tables
            .iter()
            .map(render_table)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn render_table(table: &TableDescription) -> String {
    let mut lines = vec![format!("### Table: {}", table.name)];
    if let Some(description) = &table.description {
        lines.push(format!("Description: {}", description));
    }
    if let Some(rows) = table.row_count.filter(|n| *n > 0) {
        lines.push(format!("Rows: ~{}", thousands(rows)));
    }

    for column in &table.columns {
        let mut line = format!("  - {} ({})", column.name, column.data_type);
        if column.is_primary_key {
            line.push_str(" [PK]");
        }
        if let (true, Some(target)) = (column.is_foreign_key, &column.foreign_key_target) {
            line.push_str(&format!(" [FK → {}]", target));
        }
        if let Some(term) = &column.business_term {
            line.push_str(&format!(" — \"{}\"", term));
        } else if let Some(description) = &column.description {
            line.push_str(&format!(" — {}", description));
        }
        if !column.sample_values.is_empty() {
            let samples: Vec<String> = column
                .sample_values
                .iter()
                .take(MAX_RENDERED_SAMPLES)
                .map(sample_text)
                .collect();
            line.push_str(&format!(" (e.g., {})", samples.join(", ")));
        }
        lines.push(line);
    }

    lines.join("\n")
}

fn sample_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Source of the rendered schema text for a connection. A connection the
/// organization does not own is `DbError::NotFound`.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_schema_context(&self, connection_id: &str, org_id: Option<&str>) -> Result<String, DbError>;
}
