//! Row store persisted to a JSON file
//!
//! Serves reads and change feeds from an in-memory copy and rewrites the
//! whole file atomically after every write. A write is visible, and its
//! change event published, only once the file holds it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::file_io::{read_json, write_json_atomic};
use super::memory::{MemoryStore, Tables};
use super::{ChangeEvent, ChangeFeed, RemoteStore};
use crate::config::LedgerPaths;
use crate::error::{LedgerError, LedgerResult};
use crate::models::Record;

/// File-backed row store for local and offline use
pub struct FileStore {
    path: PathBuf,
    rows: MemoryStore,
    /// Serializes write-then-persist so the file never regresses
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, loading existing rows if present
    pub fn open(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let path = path.into();
        let tables: Tables = read_json(&path)?;
        info!(path = %path.display(), tables = tables.len(), "opened file store");
        Ok(Self {
            path,
            rows: MemoryStore::with_tables(tables),
            write_lock: Mutex::new(()),
        })
    }

    /// Open the store at its default location
    pub fn open_default(paths: &LedgerPaths) -> LedgerResult<Self> {
        paths.ensure_directories()?;
        Self::open(paths.store_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory rows, for seeding and inspection
    pub fn rows(&self) -> &MemoryStore {
        &self.rows
    }

    /// Write the current rows to disk on the blocking pool
    pub async fn persist(&self) -> LedgerResult<()> {
        let tables = self.rows.snapshot()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &tables))
            .await
            .map_err(|e| LedgerError::Storage(format!("Persist task failed: {}", e)))??;
        debug!(path = %self.path.display(), "store persisted");
        Ok(())
    }

    /// Apply a write to the in-memory rows, persist, then publish
    ///
    /// Holds the write lock throughout. If persisting fails the rows are
    /// put back and nothing is published.
    async fn commit<T>(
        &self,
        apply: impl FnOnce(&MemoryStore) -> LedgerResult<(T, ChangeEvent)>,
    ) -> LedgerResult<T> {
        let _guard = self.write_lock.lock().await;
        let before = self.rows.snapshot()?;
        let (value, event) = apply(&self.rows)?;

        if let Err(e) = self.persist().await {
            warn!(path = %self.path.display(), "write reverted: {}", e);
            self.rows.replace_tables(before)?;
            return Err(e);
        }
        self.rows.publish(event);
        Ok(value)
    }
}

#[async_trait]
impl RemoteStore for FileStore {
    async fn insert(&self, table: &str, row: Record) -> LedgerResult<Record> {
        self.commit(|rows| rows.apply_insert(table, row)).await
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> LedgerResult<Record> {
        self.commit(|rows| rows.apply_update(table, id, patch)).await
    }

    async fn delete(&self, table: &str, id: &str) -> LedgerResult<()> {
        self.commit(|rows| rows.apply_delete(table, id).map(|event| ((), event)))
            .await
    }

    async fn select(&self, table: &str, owner_id: &str) -> LedgerResult<Vec<Record>> {
        self.rows.select(table, owner_id).await
    }

    async fn subscribe(&self, table: &str, owner_id: &str) -> LedgerResult<ChangeFeed> {
        self.rows.subscribe(table, owner_id).await
    }
}
