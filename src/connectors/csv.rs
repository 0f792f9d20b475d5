use async_trait::async_trait;
use duckdb::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tracing::info;

use super::duckdb::DuckDbConnector;
use super::{quote_ident, ColumnInfo, ConnectionParams, Connector, ConnectorError, QueryResult, TableInfo};

/// One lock per connection id, so two turns never ingest into the same file.
static INGEST_LOCKS: LazyLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn ingest_lock(connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = INGEST_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(locks.entry(connection_id.to_string()).or_default())
}

/// A CSV file ingested into its own single-file DuckDB database, then queried
/// read-only like any other DuckDB connection.
pub struct CsvConnector {
    inner: DuckDbConnector,
}

impl CsvConnector {
    pub async fn open(params: &ConnectionParams, data_dir: &Path) -> Result<Self, ConnectorError> {
        let csv_path = params
            .file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| ConnectorError::Config("file_path is required for csv".to_string()))?;
        if !csv_path.exists() {
            return Err(ConnectorError::Connection(format!(
                "CSV file not found: {}",
                csv_path.display()
            )));
        }

        let db_path = data_dir.join(format!("{}.duckdb", params.id));
        // staleness is re-checked under the lock; a waiter usually finds the
        // file already fresh
        let lock = ingest_lock(&params.id);
        let _guard = lock.lock().await;
        if needs_ingest(&csv_path, &db_path)? {
            let table = table_name_for(&csv_path);
            let (csv, db) = (csv_path.clone(), db_path.clone());
            tokio::task::spawn_blocking(move || ingest(&csv, &db, &table)).await??;
        }

        Ok(Self {
            inner: DuckDbConnector::open(&db_path).await?,
        })
    }
}

fn needs_ingest(csv_path: &Path, db_path: &Path) -> Result<bool, ConnectorError> {
    if !db_path.exists() {
        return Ok(true);
    }
    let csv_modified = std::fs::metadata(csv_path)?.modified()?;
    let db_modified = std::fs::metadata(db_path)?.modified()?;
    Ok(csv_modified > db_modified)
}

/// Table name from the file stem: `Q4 Sales-2024.csv` -> `q4_sales_2024`.
pub fn table_name_for(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("data");
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    name
}

fn ingest(csv_path: &Path, db_path: &Path, table: &str) -> Result<(), ConnectorError> {
    let conn = Connection::open(db_path)?;
    let source = csv_path.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_csv_auto('{}', SAMPLE_SIZE=-1)",
        quote_ident(table),
        source
    ))?;

    let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| row.get(0))?;
    info!(
        "Ingested {} rows from {} into {}",
        rows,
        csv_path.display(),
        db_path.display()
    );
    Ok(())
}

#[async_trait]
impl Connector for CsvConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.inner.test_connection().await
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError> {
        self.inner.list_tables().await
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ConnectorError> {
        self.inner.list_columns(table).await
    }

    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> QueryResult {
        self.inner.execute_query(sql, timeout, max_rows).await
    }

    async fn sample_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<Value>, ConnectorError> {
        self.inner.sample_values(table, column, limit).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
