use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::Mutex;

/// r2d2 manager for the application database.
///
/// Pooled connections are clones of one base connection, so they share a
/// single database instance. This also makes `:memory:` usable with more
/// than one pooled connection.
pub struct DuckDBConnectionManager {
    base: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: &str) -> Result<Self, duckdb::Error> {
        let base = if connection_string == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(connection_string)?
        };
        Ok(Self {
            base: Mutex::new(base),
        })
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        // the guarded connection is never mutated, so a poisoned lock is still usable
        let base = self.base.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        base.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
