//! Application database: organizations and budgets, registered connections,
//! discovered schema metadata and chat history, all in one DuckDB file.

pub mod chat_store;
pub mod connections;
pub mod db_pool;
pub mod organizations;
pub mod schema_manager;

use chrono::{DateTime, Utc};
use duckdb::Connection;
use r2d2::Pool;
use thiserror::Error;
use tracing::{info, warn};

use crate::connectors::ConnectorError;
use db_pool::DuckDBConnectionManager;

pub use chat_store::ChatStore;
pub use connections::ConnectionStore;
pub use organizations::OrganizationStore;
pub use schema_manager::SchemaManager;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS organizations (
    id VARCHAR PRIMARY KEY,
    name VARCHAR NOT NULL,
    plan VARCHAR NOT NULL,
    token_budget_monthly BIGINT NOT NULL,
    token_usage_current BIGINT NOT NULL DEFAULT 0,
    budget_reset_at BIGINT,
    created_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS connections (
    id VARCHAR PRIMARY KEY,
    org_id VARCHAR,
    name VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    host VARCHAR,
    port INTEGER,
    database_name VARCHAR,
    username VARCHAR,
    password VARCHAR,
    readonly_username VARCHAR,
    readonly_password VARCHAR,
    file_path VARCHAR,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    last_synced_at BIGINT,
    created_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_tables (
    id VARCHAR PRIMARY KEY,
    connection_id VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL,
    table_type VARCHAR,
    row_count BIGINT,
    ai_description VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_columns (
    id VARCHAR PRIMARY KEY,
    schema_table_id VARCHAR NOT NULL,
    column_name VARCHAR NOT NULL,
    data_type VARCHAR NOT NULL,
    is_nullable BOOLEAN NOT NULL,
    is_primary_key BOOLEAN NOT NULL,
    is_foreign_key BOOLEAN NOT NULL,
    fk_references VARCHAR,
    ordinal_position INTEGER NOT NULL,
    sample_values VARCHAR,
    ai_description VARCHAR,
    ai_business_term VARCHAR
);

CREATE SEQUENCE IF NOT EXISTS chat_message_seq;

CREATE TABLE IF NOT EXISTS chat_messages (
    id VARCHAR PRIMARY KEY,
    seq BIGINT NOT NULL DEFAULT nextval('chat_message_seq'),
    session_id VARCHAR NOT NULL,
    role VARCHAR NOT NULL,
    content VARCHAR NOT NULL,
    context_summary VARCHAR,
    generated_sql VARCHAR,
    chart_config VARCHAR,
    query_result_preview VARCHAR,
    full_result_row_count BIGINT,
    execution_time_ms BIGINT,
    error_message VARCHAR,
    created_at BIGINT NOT NULL
);
";

/// Pooled handle to the application database. DuckDB calls block, so all
/// work goes through [`AppDb::run`] on the blocking thread pool.
#[derive(Clone)]
pub struct AppDb {
    pool: Pool<DuckDBConnectionManager>,
}

impl AppDb {
    pub fn open(connection_string: &str, pool_size: u32) -> Result<Self, DbError> {
        info!("Opening application database {} (pool size {})", connection_string, pool_size);
        let manager = DuckDBConnectionManager::new(connection_string)?;
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        let db = Self { pool };
        db.pool.get()?.execute_batch(MIGRATIONS)?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DbError> {
        Self::open(":memory:", 2)
    }

    pub async fn run<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    /// Like [`AppDb::run`], inside one transaction: an error from `f` rolls
    /// back everything it wrote.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        self.run(move |conn| {
            conn.execute_batch("BEGIN TRANSACTION")?;
            match f(conn) {
                Ok(value) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        warn!("Rollback failed: {}", rollback);
                    }
                    Err(e)
                }
            }
        })
        .await
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pooled_connections_share_one_in_memory_database() {
        let db = AppDb::in_memory().unwrap();
        db.run(|conn| {
            conn.execute_batch("CREATE TABLE numbers (n INTEGER); INSERT INTO numbers VALUES (7);")?;
            Ok(())
        })
        .await
        .unwrap();

        let n: i32 = db
            .run(|conn| Ok(conn.query_row("SELECT n FROM numbers", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 7);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_nothing_behind() {
        let db = AppDb::in_memory().unwrap();
        db.run(|conn| Ok(conn.execute_batch("CREATE TABLE numbers (n INTEGER)")?))
            .await
            .unwrap();

        let failed = db
            .transaction(|conn| -> Result<(), DbError> {
                conn.execute("INSERT INTO numbers VALUES (1)", [])?;
                Err(DbError::Invalid("second write failed".to_string()))
            })
            .await;
        assert!(matches!(failed, Err(DbError::Invalid(_))));

        db.transaction(|conn| Ok(conn.execute("INSERT INTO numbers VALUES (2)", [])?))
            .await
            .unwrap();
        let rows: Vec<i32> = db
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT n FROM numbers")?;
                let rows = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .unwrap();
        assert_eq!(rows, vec![2]);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
