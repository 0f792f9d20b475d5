//! Target-database connectors. Each backing store kind implements
//! [`Connector`]; query execution never fails past this boundary and reports
//! errors inside the returned [`QueryResult`] instead.

pub mod csv;
pub mod duckdb;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid connection settings: {0}")]
    Config(String),
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows actually returned; a capped execution reports the capped count.
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn success(columns: Vec<String>, rows: Vec<Vec<Value>>, elapsed: Duration) -> Self {
        Self {
            columns: dedupe_column_names(columns),
            row_count: rows.len(),
            rows,
            execution_time_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            execution_time_ms: elapsed.as_millis() as u64,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Makes column names unique: the second `id` becomes `id_2`, the third `id_3`.
pub fn dedupe_column_names(columns: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::with_capacity(columns.len());
    for name in columns {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            out.push(name);
            continue;
        }
        let mut suffix = *count;
        let mut candidate = format!("{}_{}", name, suffix);
        while seen.contains_key(&candidate) || out.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}_{}", name, suffix);
        }
        out.push(candidate);
    }
    out
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: String,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    /// `table.column` the foreign key points at
    pub fk_references: Option<String>,
    pub ordinal_position: i32,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn test_connection(&self) -> Result<(), ConnectorError>;

    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError>;

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ConnectorError>;

    /// Runs `sql` with a statement timeout and a row cap enforced while
    /// fetching. Never returns an error; failures are in `QueryResult::error`.
    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> QueryResult;

    async fn sample_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<Value>, ConnectorError>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Postgres,
    Duckdb,
    Csv,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Postgres => "postgres",
            ConnectorKind::Duckdb => "duckdb",
            ConnectorKind::Csv => "csv",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "postgres" | "postgresql" => Some(ConnectorKind::Postgres),
            "duckdb" => Some(ConnectorKind::Duckdb),
            "csv" => Some(ConnectorKind::Csv),
            _ => None,
        }
    }
}

/// Everything needed to open a connector. `username`/`password` are the
/// credentials to use, already chosen between read-only and primary.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub id: String,
    pub kind: ConnectorKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub file_path: Option<String>,
}

pub async fn create_connector(
    params: &ConnectionParams,
    data_dir: &Path,
) -> Result<Box<dyn Connector>, ConnectorError> {
    let connector: Box<dyn Connector> = match params.kind {
        ConnectorKind::Postgres => Box::new(postgres::PostgresConnector::connect(params).await?),
        ConnectorKind::Duckdb => {
            let path = params
                .file_path
                .as_deref()
                .ok_or_else(|| ConnectorError::Config("file_path is required for duckdb".to_string()))?;
            Box::new(duckdb::DuckDbConnector::open(path).await?)
        }
        ConnectorKind::Csv => Box::new(csv::CsvConnector::open(params, data_dir).await?),
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_columns_get_numbered_suffixes() {
        assert_eq!(
            dedupe_column_names(names(&["id", "name", "id", "id"])),
            names(&["id", "name", "id_2", "id_3"])
        );
        // an existing column named like the suffix is not clobbered
        assert_eq!(
            dedupe_column_names(names(&["id", "id_2", "id"])),
            names(&["id", "id_2", "id_3"])
        );
    }

    #[test]
    fn failure_results_carry_error_and_no_rows() {
        let result = QueryResult::failure("boom", Duration::from_millis(12));
        assert!(result.is_error());
        assert_eq!(result.row_count, 0);
        assert_eq!(result.execution_time_ms, 12);
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("order items"), "\"order items\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
