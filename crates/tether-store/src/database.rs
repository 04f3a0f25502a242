use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Shared SQLite connection. Clones hand out the same connection; callers
/// serialize through [`Database::with_conn`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open the store file, creating it and its directory on first use.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        let db = Self::wrap(conn, path.to_path_buf())?;
        info!(path = %path.display(), "message store opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::wrap(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn wrap(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::CONNECTION_PRAGMAS)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn user_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = user_version(conn)?;
    if current >= schema::SCHEMA_VERSION {
        return Ok(());
    }
    debug!(from = current, to = schema::SCHEMA_VERSION, "migrating message store");
    conn.execute_batch(schema::MIGRATION_V1)?;
    conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
    Ok(())
}
