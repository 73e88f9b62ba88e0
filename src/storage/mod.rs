//! Remote row store boundary
//!
//! The sync layer talks to the backing store only through [`RemoteStore`]:
//! row-level insert/update/delete, owner-scoped selects and a per-table
//! change feed. [`MemoryStore`] keeps rows in process; [`FileStore`] adds
//! atomic JSON persistence on top of it.

pub mod file;
pub mod file_io;
pub mod memory;
#[cfg(test)]
pub mod testing;

pub use file::FileStore;
pub use file_io::{read_json, write_json_atomic};
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LedgerResult;
use crate::models::Record;

/// What happened to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change pushed by the store
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub owner_id: String,
    /// Row after the change (absent for deletes)
    pub new: Option<Record>,
    /// Row before the change (absent for inserts)
    pub old: Option<Record>,
}

/// Receiving end of a change subscription
///
/// `recv` yields `None` once the store drops the channel.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Take a queued event without waiting
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; events already queued are discarded
    pub fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Row store the sync layer reads from and writes to
///
/// Rows are owner-scoped through the `user_id` column. Every successful
/// write is published to matching change feeds, including writes made by
/// other sessions.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a row, returning it with server-assigned columns
    async fn insert(&self, table: &str, row: Record) -> LedgerResult<Record>;

    /// Merge `patch` into the row with `id`
    async fn update(&self, table: &str, id: &str, patch: Record) -> LedgerResult<Record>;

    /// Remove the row with `id`
    async fn delete(&self, table: &str, id: &str) -> LedgerResult<()>;

    /// All rows of `table` owned by `owner_id`, newest first
    async fn select(&self, table: &str, owner_id: &str) -> LedgerResult<Vec<Record>>;

    /// Open a change feed for rows of `table` owned by `owner_id`
    async fn subscribe(&self, table: &str, owner_id: &str) -> LedgerResult<ChangeFeed>;
}
