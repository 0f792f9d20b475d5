//! Validated, bounded execution of SQL against registered connections.

pub mod connection_manager;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::ai::validator::SqlSafetyValidator;
use crate::config::QueryConfig;
use crate::connectors::QueryResult;
pub use connection_manager::ConnectionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRef {
    pub connection_id: String,
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

impl From<&QueryConfig> for QueryLimits {
    fn from(config: &QueryConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            max_rows: config.max_rows,
        }
    }
}

#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Never fails; every problem comes back in `QueryResult::error`.
    /// `prevalidated` skips the safety check for SQL that already passed it.
    async fn execute(&self, target: &ConnectionRef, sql: &str, limits: QueryLimits, prevalidated: bool) -> QueryResult;
}

pub struct QueryExecutor {
    connections: Arc<ConnectionManager>,
    validator: SqlSafetyValidator,
}

impl QueryExecutor {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            validator: SqlSafetyValidator::new(),
        }
    }
}

#[async_trait]
impl QueryRunner for QueryExecutor {
    async fn execute(&self, target: &ConnectionRef, sql: &str, limits: QueryLimits, prevalidated: bool) -> QueryResult {
        let start = Instant::now();

        let sql = if prevalidated {
            sql.to_string()
        } else {
            let validation = self.validator.validate(sql);
            match (validation.is_safe, validation.normalized_sql) {
                (true, Some(normalized)) => normalized,
                _ => {
                    let reason = validation.reason.unwrap_or_else(|| "Query rejected".to_string());
                    warn!("Rejected query for {}: {}", target.connection_id, reason);
                    return QueryResult::failure(format!("Query blocked: {}", reason), start.elapsed());
                }
            }
        };

        let connector = match self
            .connections
            .get_connector(&target.connection_id, target.org_id.as_deref())
            .await
        {
            Ok(connector) => connector,
            Err(e) => return QueryResult::failure(e.to_string(), start.elapsed()),
        };

        let result = connector.execute_query(&sql, limits.timeout, limits.max_rows).await;
        connector.close().await;

        if !result.is_error() {
            info!(
                "Query on {} returned {} rows in {}ms",
                target.connection_id, result.row_count, result.execution_time_ms
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connections::tests::duckdb_connection;
    use crate::db::{AppDb, ConnectionStore};
    use tempfile::TempDir;

    async fn executor(dir: &TempDir) -> (QueryExecutor, ConnectionRef) {
        let path = dir.path().join("w.duckdb");
        duckdb::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE items AS SELECT i AS id FROM range(0, 50) t(i)")
            .unwrap();

        let store = Arc::new(ConnectionStore::new(AppDb::in_memory().unwrap()));
        let record = store
            .create(None, duckdb_connection("w", &path.to_string_lossy()))
            .await
            .unwrap();
        let manager = Arc::new(ConnectionManager::new(store, dir.path().to_path_buf()));
        let target = ConnectionRef {
            connection_id: record.id,
            org_id: None,
        };
        (QueryExecutor::new(manager), target)
    }

    fn limits(max_rows: usize) -> QueryLimits {
        QueryLimits {
            timeout: Duration::from_secs(5),
            max_rows,
        }
    }

    #[tokio::test]
    async fn runs_capped_reads() {
        let dir = TempDir::new().unwrap();
        let (executor, target) = executor(&dir).await;
        let result = executor.execute(&target, "SELECT id FROM items", limits(20), false).await;
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.row_count, 20);
    }

    #[tokio::test]
    async fn unvalidated_writes_never_reach_the_database() {
        let dir = TempDir::new().unwrap();
        let (executor, target) = executor(&dir).await;
        let result = executor.execute(&target, "DROP TABLE items", limits(20), false).await;
        assert!(result.error.unwrap().starts_with("Query blocked:"));
    }

    #[tokio::test]
    async fn unknown_connections_come_back_as_errors() {
        let dir = TempDir::new().unwrap();
        let (executor, _) = executor(&dir).await;
        let target = ConnectionRef {
            connection_id: "missing".to_string(),
            org_id: None,
        };
        let result = executor.execute(&target, "SELECT 1", limits(20), true).await;
        assert!(result.error.unwrap().contains("Connection missing not found"));
    }
}
