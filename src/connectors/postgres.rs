use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info, warn};

use super::{quote_ident, ColumnInfo, ConnectionParams, Connector, ConnectorError, QueryResult, TableInfo};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostgresConnector {
    client: Mutex<Client>,
    connection_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    schema: String,
}

impl PostgresConnector {
    pub async fn connect(params: &ConnectionParams) -> Result<Self, ConnectorError> {
        let host = params
            .host
            .as_deref()
            .ok_or_else(|| ConnectorError::Config("host is required for postgres".to_string()))?;
        let database = params
            .database
            .as_deref()
            .ok_or_else(|| ConnectorError::Config("database is required for postgres".to_string()))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(params.port.unwrap_or(5432))
            .dbname(database)
            .connect_timeout(CONNECT_TIMEOUT)
            .application_name("datamind");
        if let Some(user) = &params.username {
            config.user(user);
        }
        if let Some(password) = &params.password {
            config.password(password);
        }

        let (client, connection) = config.connect(NoTls).await?;
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });

        info!("Connected to postgres database {} on {}", database, host);
        Ok(Self {
            client: Mutex::new(client),
            connection_task: std::sync::Mutex::new(Some(task)),
            schema: "public".to_string(),
        })
    }

    async fn fetch_capped(
        &self,
        sql: &str,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>), ConnectorError> {
        let mut client = self.client.lock().await;
        let tx = client.build_transaction().read_only(true).start().await?;
        tx.batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
            .await?;

        let stmt = tx.prepare(sql).await?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        // a portal fetch stops at max_rows on the server side
        let portal = tx.bind(&stmt, &[]).await?;
        let max_rows = i32::try_from(max_rows.max(1)).unwrap_or(i32::MAX);
        let rows = tx.query_portal(&portal, max_rows).await?;
        tx.rollback().await?;

        let values = rows
            .iter()
            .map(|row| {
                stmt.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| pg_value_to_json(row, i, col.type_()))
                    .collect()
            })
            .collect();

        Ok((columns, values))
    }
}

fn pg_value_to_json(row: &Row, idx: usize, pg_type: &Type) -> Value {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).and_then(|v| serde_json::Number::from_f64(v as f64)).map(Value::Number),
        Type::FLOAT8 => get::<f64>(row, idx).and_then(serde_json::Number::from_f64).map(Value::Number),
        Type::NUMERIC => get::<Decimal>(row, idx).map(|d| {
            d.to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(d.to_string()))
        }),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(|ts| Value::String(ts.to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(|ts| Value::String(ts.to_rfc3339())),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let client = self.client.lock().await;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT t.table_name, t.table_type, c.reltuples::bigint
                 FROM information_schema.tables t
                 LEFT JOIN pg_namespace n ON n.nspname = t.table_schema
                 LEFT JOIN pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid
                 WHERE t.table_schema = $1
                 ORDER BY t.table_name",
                &[&self.schema],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| TableInfo {
                name: row.get(0),
                table_type: row.get(1),
                // reltuples is -1 for tables that were never analyzed
                row_count: row
                    .get::<_, Option<i64>>(2)
                    .filter(|n| *n >= 0)
                    .map(|n| n as u64),
            })
            .collect())
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, ConnectorError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT
                    c.column_name,
                    c.data_type,
                    c.is_nullable = 'YES' AS is_nullable,
                    COALESCE(pk.is_pk, false) AS is_primary_key,
                    COALESCE(fk.is_fk, false) AS is_foreign_key,
                    fk.foreign_table,
                    fk.foreign_column,
                    c.ordinal_position::int
                 FROM information_schema.columns c
                 LEFT JOIN (
                    SELECT kcu.column_name, true AS is_pk
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                 ) pk ON pk.column_name = c.column_name
                 LEFT JOIN (
                    SELECT
                        kcu.column_name,
                        true AS is_fk,
                        ccu.table_name AS foreign_table,
                        ccu.column_name AS foreign_column
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    JOIN information_schema.constraint_column_usage ccu
                        ON ccu.constraint_name = tc.constraint_name
                    WHERE tc.constraint_type = 'FOREIGN KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                 ) fk ON fk.column_name = c.column_name
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[&self.schema, &table],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let foreign_table: Option<String> = row.get(5);
                let foreign_column: Option<String> = row.get(6);
                ColumnInfo {
                    name: row.get(0),
                    data_type: row.get(1),
                    is_nullable: row.get(2),
                    is_primary_key: row.get(3),
                    is_foreign_key: row.get(4),
                    fk_references: foreign_table
                        .zip(foreign_column)
                        .map(|(t, c)| format!("{}.{}", t, c)),
                    ordinal_position: row.get(7),
                }
            })
            .collect())
    }

    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> QueryResult {
        let start = Instant::now();
        debug!("Executing on postgres: {}", sql);

        match self.fetch_capped(sql, timeout, max_rows).await {
            Ok((columns, rows)) => QueryResult::success(columns, rows, start.elapsed()),
            Err(e) => {
                let message = match &e {
                    ConnectorError::Postgres(pg) => pg
                        .as_db_error()
                        .map(|db| db.message().to_string())
                        .unwrap_or_else(|| pg.to_string()),
                    other => other.to_string(),
                };
                warn!("Postgres query failed: {}", message);
                QueryResult::failure(message, start.elapsed())
            }
        }
    }

    async fn sample_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<Value>, ConnectorError> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM {schema}.{table} WHERE {col} IS NOT NULL LIMIT {limit}",
            col = quote_ident(column),
            schema = quote_ident(&self.schema),
            table = quote_ident(table),
            limit = limit
        );
        let (_, rows) = self.fetch_capped(&sql, Duration::from_secs(10), limit).await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }

    async fn close(&self) {
        let task = match self.connection_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}
