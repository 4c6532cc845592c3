// src/store.rs

use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key-value store holding the chunk state of one download.
///
/// Clones share a single background SQLite connection, which serialises every
/// call; callers on different tasks need no extra locking.
#[derive(Clone)]
pub struct ChunkStore {
    conn: Connection,
    path: PathBuf,
}

impl ChunkStore {
    /// Whether a store was already created at `path` by an earlier run.
    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Opens the store at `path`, creating the database if needed.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path.to_path_buf()).await?;
        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS chunks (
                        key             BLOB PRIMARY KEY,
                        value           BLOB NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_vec();
        let value = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM chunks WHERE key = ?1",
                        params![key],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    pub async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let key = key.to_vec();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO chunks (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let key = key.to_vec();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM chunks WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Writes many entries in one transaction.
    pub async fn set_many(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt =
                        tx.prepare("INSERT OR REPLACE INTO chunks (key, value) VALUES (?1, ?2)")?;
                    for (key, value) in &entries {
                        stmt.execute(params![key, value])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM chunks", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All keys currently present, in byte order.
    pub async fn keys(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let keys = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM chunks ORDER BY key")?;
                let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
                let keys = rows.collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(keys)
            })
            .await?;
        Ok(keys)
    }

    /// Calls `visit` for every key, stopping at the first error it returns.
    pub async fn iter_keys<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
        E: From<StoreError>,
    {
        for key in self.keys().await? {
            visit(&key)?;
        }
        Ok(())
    }

    /// Closes the underlying connection. Outstanding clones start failing.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }

    /// Deletes the database at `path` and its journal side files.
    pub async fn destroy(path: &Path) -> Result<(), StoreError> {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            match tokio::fs::remove_file(PathBuf::from(file)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
