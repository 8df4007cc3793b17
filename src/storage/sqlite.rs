// SQLite storage backend
// One file can hold many scopes, so several surface processes can share it

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{Storage, StorageError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_kv (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (scope, key)
)";

/// SQLite-backed storage bound to one scope (an origin or a cookie domain)
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    scope: String,
}

impl SqliteStorage {
    /// Open (or create) the database file and bind to `scope`
    pub fn open(path: &Path, scope: impl Into<String>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Unavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, scope)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory(scope: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, scope)
    }

    fn with_connection(conn: Connection, scope: impl Into<String>) -> Result<Self, StorageError> {
        conn.busy_timeout(std::time::Duration::from_secs(2))?;
        conn.execute(SCHEMA, [])?;
        let scope = scope.into();
        tracing::debug!(scope = %scope, "Opened SQLite session storage");
        Ok(Self {
            conn: Mutex::new(conn),
            scope,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))?;
        Ok(f(&conn)?)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM session_kv WHERE scope = ?1 AND key = ?2",
                params![self.scope, key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_kv (scope, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value",
                params![self.scope, key, value],
            )
            .map(|_| ())
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_kv WHERE scope = ?1 AND key = ?2",
                params![self.scope, key],
            )
            .map(|_| ())
        })
    }
}
