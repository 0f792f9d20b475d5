use chrono::{DateTime, Utc};
use duckdb::{params, OptionalExt, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{from_millis, new_id, to_millis, AppDb, DbError};
use crate::connectors::{ConnectionParams, ConnectorKind};

/// Fields accepted when registering a target database.
#[derive(Debug, Clone, Deserialize)]
pub struct NewConnection {
    pub name: String,
    pub kind: ConnectorKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub readonly_username: Option<String>,
    pub readonly_password: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub org_id: Option<String>,
    pub name: String,
    pub kind: ConnectorKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub readonly_username: Option<String>,
    #[serde(skip_serializing)]
    pub readonly_password: Option<String>,
    pub file_path: Option<String>,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Parameters for opening a connector. Queries run with the read-only
    /// credentials whenever they are configured.
    pub fn params(&self) -> ConnectionParams {
        let (username, password) = match &self.readonly_username {
            Some(user) => (Some(user.clone()), self.readonly_password.clone()),
            None => (self.username.clone(), self.password.clone()),
        };
        ConnectionParams {
            id: self.id.clone(),
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username,
            password,
            file_path: self.file_path.clone(),
        }
    }
}

const SELECT_CONNECTION: &str = "SELECT id, org_id, name, kind, host, port, database_name, username, password,
        readonly_username, readonly_password, file_path, is_active, last_synced_at
    FROM connections";

fn record_from_row(row: &Row<'_>) -> duckdb::Result<ConnectionRecord> {
    let kind: String = row.get(3)?;
    Ok(ConnectionRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        // rows are only ever written from a parsed ConnectorKind
        kind: ConnectorKind::parse(&kind).unwrap_or(ConnectorKind::Duckdb),
        host: row.get(4)?,
        port: row.get::<_, Option<i32>>(5)?.and_then(|p| u16::try_from(p).ok()),
        database: row.get(6)?,
        username: row.get(7)?,
        password: row.get(8)?,
        readonly_username: row.get(9)?,
        readonly_password: row.get(10)?,
        file_path: row.get(11)?,
        is_active: row.get(12)?,
        last_synced_at: row.get::<_, Option<i64>>(13)?.and_then(from_millis),
    })
}

pub struct ConnectionStore {
    db: AppDb,
}

impl ConnectionStore {
    pub fn new(db: AppDb) -> Self {
        Self { db }
    }

    pub async fn create(&self, org_id: Option<&str>, new: NewConnection) -> Result<ConnectionRecord, DbError> {
        if new.name.trim().is_empty() {
            return Err(DbError::Invalid("Connection name is required".to_string()));
        }
        let id = new_id();
        let org_id = org_id.map(str::to_string);
        let record_id = id.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO connections
                        (id, org_id, name, kind, host, port, database_name, username, password,
                         readonly_username, readonly_password, file_path, is_active, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, TRUE, ?)",
                    params![
                        record_id,
                        org_id,
                        new.name,
                        new.kind.as_str(),
                        new.host,
                        new.port.map(i32::from),
                        new.database,
                        new.username,
                        new.password,
                        new.readonly_username,
                        new.readonly_password,
                        new.file_path,
                        to_millis(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await?;
        info!("Registered connection {}", id);

        self.get(&id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Connection {} not found", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConnectionRecord>, DbError> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                Ok(conn
                    .query_row(&format!("{} WHERE id = ?", SELECT_CONNECTION), [&id], record_from_row)
                    .optional()?)
            })
            .await
    }

    /// A connection is only visible to the organization that owns it.
    pub async fn get_for_org(&self, id: &str, org_id: Option<&str>) -> Result<Option<ConnectionRecord>, DbError> {
        let id = id.to_string();
        let org_id = org_id.map(str::to_string);
        self.db
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("{} WHERE id = ? AND org_id IS NOT DISTINCT FROM ?", SELECT_CONNECTION),
                        params![id, org_id],
                        record_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    pub async fn list_for_org(&self, org_id: Option<&str>) -> Result<Vec<ConnectionRecord>, DbError> {
        let org_id = org_id.map(str::to_string);
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE org_id IS NOT DISTINCT FROM ? ORDER BY created_at",
                    SELECT_CONNECTION
                ))?;
                let records = stmt
                    .query_map(params![org_id], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }

    pub async fn mark_synced(&self, id: &str) -> Result<(), DbError> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE connections SET last_synced_at = ? WHERE id = ?",
                    params![to_millis(Utc::now()), id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), DbError> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.execute("UPDATE connections SET is_active = ? WHERE id = ?", params![active, id])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn duckdb_connection(name: &str, path: &str) -> NewConnection {
        NewConnection {
            name: name.to_string(),
            kind: ConnectorKind::Duckdb,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            readonly_username: None,
            readonly_password: None,
            file_path: Some(path.to_string()),
        }
    }

    #[tokio::test]
    async fn connections_are_scoped_to_their_org() {
        let store = ConnectionStore::new(AppDb::in_memory().unwrap());
        let created = store
            .create(Some("acme"), duckdb_connection("warehouse", "/data/w.duckdb"))
            .await
            .unwrap();
        assert!(created.is_active);
        assert_eq!(created.kind, ConnectorKind::Duckdb);

        assert!(store.get_for_org(&created.id, Some("acme")).await.unwrap().is_some());
        assert!(store.get_for_org(&created.id, Some("globex")).await.unwrap().is_none());
        assert!(store.get_for_org(&created.id, None).await.unwrap().is_none());
        assert_eq!(store.list_for_org(Some("acme")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_only_credentials_win_when_present() {
        let store = ConnectionStore::new(AppDb::in_memory().unwrap());
        let mut new = duckdb_connection("pg", "");
        new.kind = ConnectorKind::Postgres;
        new.host = Some("db.internal".to_string());
        new.port = Some(5433);
        new.username = Some("owner".to_string());
        new.password = Some("owner-secret".to_string());
        new.readonly_username = Some("reader".to_string());
        new.readonly_password = Some("reader-secret".to_string());

        let record = store.create(None, new).await.unwrap();
        let params = record.params();
        assert_eq!(params.username.as_deref(), Some("reader"));
        assert_eq!(params.password.as_deref(), Some("reader-secret"));
        assert_eq!(params.port, Some(5433));

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("readonly_password").is_none());
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let store = ConnectionStore::new(AppDb::in_memory().unwrap());
        let err = store.create(None, duckdb_connection("  ", "/x")).await.unwrap_err();
        assert!(matches!(err, DbError::Invalid(_)));
    }
}
