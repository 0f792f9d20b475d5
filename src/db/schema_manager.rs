use async_trait::async_trait;
use duckdb::{params, Connection, OptionalExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{new_id, AppDb, DbError};
use crate::ai::enricher::SchemaEnrichment;
use crate::ai::schema_context::{ColumnDescription, SchemaContext, SchemaProvider, TableDescription};
use crate::connectors::{ColumnInfo, Connector, TableInfo};

const SAMPLE_LIMIT: usize = 10;

/// What a schema refresh found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoverySummary {
    pub tables: usize,
    pub columns: usize,
}

struct DiscoveredTable {
    info: TableInfo,
    columns: Vec<(ColumnInfo, Vec<Value>)>,
}

/// Persists discovered schema metadata per connection and renders it back
/// as prompt context. Nothing here talks to the target database except
/// [`SchemaManager::discover`].
#[derive(Clone)]
pub struct SchemaManager {
    db: AppDb,
}

impl SchemaManager {
    pub fn new(db: AppDb) -> Self {
        Self { db }
    }

    /// Same ownership rule as connection lookup: a request without an org
    /// only sees connections registered without one.
    async fn is_visible_to(&self, connection_id: &str, org_id: Option<&str>) -> Result<bool, DbError> {
        let connection_id = connection_id.to_string();
        let org_id = org_id.map(str::to_string);
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM connections WHERE id = ? AND org_id IS NOT DISTINCT FROM ?",
                    params![connection_id, org_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Introspects the target database and upserts tables and columns.
    /// Existing AI descriptions survive a refresh; tables and columns that
    /// disappeared are removed.
    pub async fn discover(&self, connection_id: &str, connector: &dyn Connector) -> Result<DiscoverySummary, DbError> {
        info!("Discovering schema for connection {}", connection_id);
        let mut discovered = Vec::new();
        for table in connector.list_tables().await? {
            let mut columns = Vec::new();
            for column in connector.list_columns(&table.name).await? {
                let samples = match connector.sample_values(&table.name, &column.name, SAMPLE_LIMIT).await {
                    Ok(values) => values,
                    Err(e) => {
                        debug!("No samples for {}.{}: {}", table.name, column.name, e);
                        Vec::new()
                    }
                };
                columns.push((column, samples));
            }
            discovered.push(DiscoveredTable { info: table, columns });
        }

        let summary = DiscoverySummary {
            tables: discovered.len(),
            columns: discovered.iter().map(|t| t.columns.len()).sum(),
        };

        let connection_id = connection_id.to_string();
        self.db
            .transaction(move |conn| persist(conn, &connection_id, &discovered))
            .await?;

        info!(
            "Schema refresh found {} tables and {} columns",
            summary.tables, summary.columns
        );
        Ok(summary)
    }

    pub async fn load_context(&self, connection_id: &str) -> Result<SchemaContext, DbError> {
        let connection_id = connection_id.to_string();
        self.db.run(move |conn| load(conn, &connection_id)).await
    }

    /// Stores LLM-written descriptions. Names the model made up are ignored.
    pub async fn apply_enrichment(&self, connection_id: &str, enrichment: SchemaEnrichment) -> Result<usize, DbError> {
        let connection_id = connection_id.to_string();
        self.db
            .run(move |conn| {
                let mut updated = 0;
                for table in &enrichment.tables {
                    let Some(table_id) = table_id(conn, &connection_id, &table.table_name)? else {
                        debug!("Enrichment names unknown table {}", table.table_name);
                        continue;
                    };
                    if let Some(description) = &table.description {
                        conn.execute(
                            "UPDATE schema_tables SET ai_description = ? WHERE id = ?",
                            params![description, table_id],
                        )?;
                    }
                    for column in &table.columns {
                        updated += conn.execute(
                            "UPDATE schema_columns SET ai_description = ?, ai_business_term = ?
                             WHERE schema_table_id = ? AND column_name = ?",
                            params![column.description, column.business_term, table_id, column.column_name],
                        )?;
                    }
                }
                Ok(updated)
            })
            .await
    }
}

#[async_trait]
impl SchemaProvider for SchemaManager {
    async fn get_schema_context(&self, connection_id: &str, org_id: Option<&str>) -> Result<String, DbError> {
        if !self.is_visible_to(connection_id, org_id).await? {
            return Err(DbError::NotFound(format!("Connection {} not found", connection_id)));
        }
        Ok(self.load_context(connection_id).await?.render())
    }
}

fn table_id(conn: &Connection, connection_id: &str, table_name: &str) -> Result<Option<String>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id FROM schema_tables WHERE connection_id = ? AND table_name = ?",
            params![connection_id, table_name],
            |row| row.get(0),
        )
        .optional()?)
}

fn persist(conn: &Connection, connection_id: &str, tables: &[DiscoveredTable]) -> Result<(), DbError> {
    let mut kept_tables = Vec::with_capacity(tables.len());
    for table in tables {
        let row_count = table.info.row_count.and_then(|n| i64::try_from(n).ok());
        let id = match table_id(conn, connection_id, &table.info.name)? {
            Some(id) => {
                conn.execute(
                    "UPDATE schema_tables SET table_type = ?, row_count = ? WHERE id = ?",
                    params![table.info.table_type, row_count, id],
                )?;
                id
            }
            None => {
                let id = new_id();
                conn.execute(
                    "INSERT INTO schema_tables (id, connection_id, table_name, table_type, row_count)
                     VALUES (?, ?, ?, ?, ?)",
                    params![id, connection_id, table.info.name, table.info.table_type, row_count],
                )?;
                id
            }
        };
        persist_columns(conn, &id, &table.columns)?;
        kept_tables.push(id);
    }

    let mut stmt = conn.prepare("SELECT id FROM schema_tables WHERE connection_id = ?")?;
    let existing = stmt
        .query_map([connection_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for stale in existing.iter().filter(|id| !kept_tables.contains(id)) {
        conn.execute("DELETE FROM schema_columns WHERE schema_table_id = ?", [stale])?;
        conn.execute("DELETE FROM schema_tables WHERE id = ?", [stale])?;
    }
    Ok(())
}

fn persist_columns(conn: &Connection, table_id: &str, columns: &[(ColumnInfo, Vec<Value>)]) -> Result<(), DbError> {
    for (column, samples) in columns {
        let samples = serde_json::to_string(samples)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM schema_columns WHERE schema_table_id = ? AND column_name = ?",
                params![table_id, column.name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE schema_columns SET data_type = ?, is_nullable = ?, is_primary_key = ?,
                        is_foreign_key = ?, fk_references = ?, ordinal_position = ?, sample_values = ?
                     WHERE id = ?",
                    params![
                        column.data_type,
                        column.is_nullable,
                        column.is_primary_key,
                        column.is_foreign_key,
                        column.fk_references,
                        column.ordinal_position,
                        samples,
                        id
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO schema_columns
                        (id, schema_table_id, column_name, data_type, is_nullable, is_primary_key,
                         is_foreign_key, fk_references, ordinal_position, sample_values)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        new_id(),
                        table_id,
                        column.name,
                        column.data_type,
                        column.is_nullable,
                        column.is_primary_key,
                        column.is_foreign_key,
                        column.fk_references,
                        column.ordinal_position,
                        samples
                    ],
                )?;
            }
        }
    }

    let names: Vec<&str> = columns.iter().map(|(c, _)| c.name.as_str()).collect();
    let mut stmt = conn.prepare("SELECT id, column_name FROM schema_columns WHERE schema_table_id = ?")?;
    let stored = stmt
        .query_map([table_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, name) in stored {
        if !names.contains(&name.as_str()) {
            conn.execute("DELETE FROM schema_columns WHERE id = ?", [id])?;
        }
    }
    Ok(())
}

fn load(conn: &Connection, connection_id: &str) -> Result<SchemaContext, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, table_name, ai_description, row_count
         FROM schema_tables WHERE connection_id = ? ORDER BY table_name",
    )?;
    let tables = stmt
        .query_map([connection_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                TableDescription {
                    name: row.get(1)?,
                    description: row.get(2)?,
                    row_count: row.get::<_, Option<i64>>(3)?.and_then(|n| u64::try_from(n).ok()),
                    columns: Vec::new(),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT c.schema_table_id, c.column_name, c.data_type, c.is_primary_key, c.is_foreign_key,
                c.fk_references, c.ai_business_term, c.ai_description, c.sample_values
         FROM schema_columns c
         JOIN schema_tables t ON t.id = c.schema_table_id
         WHERE t.connection_id = ?
         ORDER BY c.ordinal_position",
    )?;
    let mut columns: HashMap<String, Vec<ColumnDescription>> = HashMap::new();
    let rows = stmt.query_map([connection_id], |row| {
        let samples: Option<String> = row.get(8)?;
        Ok((
            row.get::<_, String>(0)?,
            ColumnDescription {
                name: row.get(1)?,
                data_type: row.get(2)?,
                is_primary_key: row.get(3)?,
                is_foreign_key: row.get(4)?,
                foreign_key_target: row.get(5)?,
                business_term: row.get(6)?,
                description: row.get(7)?,
                sample_values: samples
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or_default(),
            },
        ))
    })?;
    for row in rows {
        let (table_id, column) = row?;
        columns.entry(table_id).or_default().push(column);
    }

    Ok(SchemaContext {
        tables: tables
            .into_iter()
            .map(|(id, mut table)| {
                table.columns = columns.remove(&id).unwrap_or_default();
                table
            })
            .collect(),
    })
}
