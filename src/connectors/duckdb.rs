use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::{AccessMode, Config, Connection};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{quote_ident, ColumnInfo, Connector, ConnectorError, QueryResult, TableInfo};

/// A DuckDB database file opened in read-only access mode.
///
/// Every operation runs on its own clone of the base connection, so a
/// statement that outlives its timeout never blocks the next one.
pub struct DuckDbConnector {
    path: PathBuf,
    base: Arc<Mutex<Connection>>,
}

impl DuckDbConnector {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ConnectorError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConnectorError::Connection(format!(
                "database file not found: {}",
                path.display()
            )));
        }

        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, ConnectorError> {
            let config = Config::default().access_mode(AccessMode::ReadOnly)?;
            Ok(Connection::open_with_flags(&open_path, config)?)
        })
        .await??;

        info!("Opened DuckDB database {} read-only", path.display());
        Ok(Self {
            path,
            base: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs blocking work on a fresh connection on the blocking pool. The base
    /// lock is held only while cloning.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, ConnectorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ConnectorError> + Send + 'static,
    {
        let base = Arc::clone(&self.base);
        tokio::task::spawn_blocking(move || {
            let conn = base
                .lock()
                .map_err(|_| ConnectorError::Connection("connection lock poisoned".to_string()))?
                .try_clone()?;
            f(&conn)
        })
        .await?
    }
}

fn fetch_capped(conn: &Connection, sql: &str, max_rows: usize) -> Result<(Vec<String>, Vec<Vec<Value>>), ConnectorError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let columns: Vec<String> = rows
        .as_ref()
        .map(|stmt| stmt.column_names())
        .unwrap_or_default();

    let mut out = Vec::new();
    // rows past the cap are never converted
    while out.len() < max_rows {
        let Some(row) = rows.next()? else { break };
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(duck_value_to_json(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok((columns, out))
}

pub(crate) fn duck_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(v) => Value::from(v),
        ValueRef::SmallInt(v) => Value::from(v),
        ValueRef::Int(v) => Value::from(v),
        ValueRef::BigInt(v) => Value::from(v),
        ValueRef::UTinyInt(v) => Value::from(v),
        ValueRef::USmallInt(v) => Value::from(v),
        ValueRef::UInt(v) => Value::from(v),
        ValueRef::UBigInt(v) => Value::from(v),
        ValueRef::HugeInt(v) => i64::try_from(v)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(v.to_string())),
        ValueRef::Float(v) => float(v as f64),
        ValueRef::Double(v) => float(v),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(d.to_string())),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|date| Value::String(date.to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|ts| Value::String(ts.naive_utc().to_string()))
            .unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn to_micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

#[async_trait]
impl Connector for DuckDbConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.table_name, t.table_type, d.estimated_size
                 FROM information_schema.tables t
                 LEFT JOIN duckdb_tables() d
                   ON d.table_name = t.table_name AND d.schema_name = t.table_schema
                 WHERE t.table_schema = 'main'
                 ORDER BY t.table_name",
            )?;
            let tables = stmt
                .query_map([], |row| {
                    Ok(TableInfo {
                        name: row.get(0)?,
                        table_type: row.get(1)?,
                        row_count: row.get::<_, Option<i64>>(2)?.map(|n| n.max(0) as u64),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tables)
        })
        .await
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ConnectorError> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let mut pk_stmt = conn.prepare(
                "SELECT unnest(constraint_column_names)
                 FROM duckdb_constraints()
                 WHERE table_name = ? AND constraint_type = 'PRIMARY KEY'",
            )?;
            let primary_keys = pk_stmt
                .query_map([&table], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT column_name, data_type, is_nullable, ordinal_position
                 FROM information_schema.columns
                 WHERE table_schema = 'main' AND table_name = ?
                 ORDER BY ordinal_position",
            )?;
            let columns = stmt
                .query_map([&table], |row| {
                    let name: String = row.get(0)?;
                    Ok(ColumnInfo {
                        is_primary_key: primary_keys.contains(&name),
                        name,
                        data_type: row.get(1)?,
                        is_nullable: row.get::<_, String>(2)? == "YES",
                        is_foreign_key: false,
                        fk_references: None,
                        ordinal_position: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(columns)
        })
        .await
    }

    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> QueryResult {
        let start = Instant::now();
        let sql_owned = sql.to_string();
        debug!("Executing on {}: {}", self.path.display(), sql);

        // DuckDB has no statement_timeout and duckdb 1.1.1 exposes no interrupt,
        // so a timed-out statement finishes on its own clone and is discarded
        let work = self.with_conn(move |conn| fetch_capped(conn, &sql_owned, max_rows));
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok((columns, rows))) => QueryResult::success(columns, rows, start.elapsed()),
            Ok(Err(e)) => {
                warn!("DuckDB query failed: {}", e);
                QueryResult::failure(e.to_string(), start.elapsed())
            }
            Err(_) => {
                error!("DuckDB query timed out after {} ms", timeout.as_millis());
                QueryResult::failure(
                    format!("Query timed out after {} ms", timeout.as_millis()),
                    start.elapsed(),
                )
            }
        }
    }

    async fn sample_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<Value>, ConnectorError> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL LIMIT {limit}",
            col = quote_ident(column),
            table = quote_ident(table),
            limit = limit
        );
        self.with_conn(move |conn| {
            let (_, rows) = fetch_capped(conn, &sql, limit)?;
            Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
        })
        .await
    }

    async fn close(&self) {
        debug!("Closing DuckDB connector for {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("shop.duckdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name VARCHAR, region VARCHAR);
             INSERT INTO customers SELECT i, 'customer ' || i, CASE WHEN i % 2 = 0 THEN 'EU' ELSE 'US' END
             FROM range(1, 26) t(i);",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn executes_with_row_cap_and_typed_values() {
        let dir = TempDir::new().unwrap();
        let connector = DuckDbConnector::open(seed(&dir)).await.unwrap();

        let result = connector
            .execute_query("SELECT id, name FROM customers ORDER BY id", Duration::from_secs(5), 10)
            .await;
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.row_count, 10);
        assert_eq!(result.rows[0], vec![Value::from(1), Value::from("customer 1")]);
    }

    #[tokio::test]
    async fn errors_and_writes_come_back_as_results() {
        let dir = TempDir::new().unwrap();
        let connector = DuckDbConnector::open(seed(&dir)).await.unwrap();

        let missing = connector
            .execute_query("SELECT nope FROM customers", Duration::from_secs(5), 10)
            .await;
        assert!(missing.error.is_some());

        // read-only access mode rejects writes even if they get this far
        let write = connector
            .execute_query("DELETE FROM customers", Duration::from_secs(5), 10)
            .await;
        assert!(write.error.is_some());
    }

    #[tokio::test]
    async fn introspects_tables_columns_and_samples() {
        let dir = TempDir::new().unwrap();
        let connector = DuckDbConnector::open(seed(&dir)).await.unwrap();
        connector.test_connection().await.unwrap();

        let tables = connector.list_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "customers");

        let columns = connector.list_columns("customers").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns[0].is_primary_key);
        assert!(!columns[1].is_primary_key);

        let samples = connector.sample_values("customers", "region", 10).await.unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_output_columns_are_renamed() {
        let dir = TempDir::new().unwrap();
        let connector = DuckDbConnector::open(seed(&dir)).await.unwrap();
        let result = connector
            .execute_query("SELECT id, id FROM customers LIMIT 1", Duration::from_secs(5), 10)
            .await;
        assert_eq!(result.columns, vec!["id", "id_2"]);
    }

    #[tokio::test]
    async fn timed_out_query_does_not_block_the_next_one() {
        let dir = TempDir::new().unwrap();
        let connector = DuckDbConnector::open(seed(&dir)).await.unwrap();

        let slow = connector
            .execute_query("SELECT sum(i) FROM range(2000000000) t(i)", Duration::from_millis(20), 10)
            .await;
        assert_eq!(slow.error.as_deref(), Some("Query timed out after 20 ms"));

        let started = Instant::now();
        let next = connector
            .execute_query("SELECT 1 AS one", Duration::from_secs(3), 10)
            .await;
        assert!(next.error.is_none(), "{:?}", next.error);
        assert_eq!(next.rows, vec![vec![Value::from(1)]]);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        assert!(DuckDbConnector::open(dir.path().join("absent.duckdb")).await.is_err());
    }
}
