use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::connectors::{create_connector, Connector, ConnectorError};
use crate::db::ConnectionStore;

/// Resolves a connection id to an open connector, scoped to the caller's
/// organization. Lookups fail closed: a connection owned by another
/// organization looks exactly like one that does not exist.
pub struct ConnectionManager {
    store: Arc<ConnectionStore>,
    data_dir: PathBuf,
}

impl ConnectionManager {
    pub fn new(store: Arc<ConnectionStore>, data_dir: PathBuf) -> Self {
        Self { store, data_dir }
    }

    pub async fn get_connector(
        &self,
        connection_id: &str,
        org_id: Option<&str>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let record = self
            .store
            .get_for_org(connection_id, org_id)
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?
            .ok_or_else(|| ConnectorError::Connection(format!("Connection {} not found", connection_id)))?;
        if !record.is_active {
            return Err(ConnectorError::Connection(format!(
                "Connection {} is inactive",
                connection_id
            )));
        }

        debug!("Opening {} connector for {}", record.kind.as_str(), connection_id);
        create_connector(&record.params(), &self.data_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connections::tests::duckdb_connection;
    use crate::db::AppDb;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lookups_fail_closed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.duckdb");
        duckdb::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();

        let store = Arc::new(ConnectionStore::new(AppDb::in_memory().unwrap()));
        let record = store
            .create(Some("acme"), duckdb_connection("w", &path.to_string_lossy()))
            .await
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&store), dir.path().to_path_buf());

        assert!(manager.get_connector(&record.id, Some("acme")).await.is_ok());

        let err = manager.get_connector(&record.id, Some("globex")).await.err().unwrap();
        assert_eq!(err.to_string(), format!("connection failed: Connection {} not found", record.id));

        store.set_active(&record.id, false).await.unwrap();
        assert!(manager.get_connector(&record.id, Some("acme")).await.is_err());
    }
}
