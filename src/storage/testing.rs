//! Store double for observing optimistic state
//!
//! Wraps a [`MemoryStore`] and lets a test hold writes or selects open,
//! fail writes on demand and count the calls that reached the store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use super::memory::MemoryStore;
use super::{ChangeFeed, RemoteStore};
use crate::error::{LedgerError, LedgerResult};
use crate::models::Record;

pub struct GatedStore {
    pub inner: MemoryStore,
    writes_open: watch::Sender<bool>,
    selects_open: watch::Sender<bool>,
    fail_writes: AtomicBool,
    writes_seen: watch::Sender<usize>,
    selects_seen: watch::Sender<usize>,
}

impl Default for GatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            writes_open: watch::channel(true).0,
            selects_open: watch::channel(true).0,
            fail_writes: AtomicBool::new(false),
            writes_seen: watch::channel(0).0,
            selects_seen: watch::channel(0).0,
        }
    }

    /// Block writes until `release_writes`
    pub fn hold_writes(&self) {
        self.writes_open.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.writes_open.send_replace(true);
    }

    /// Block selects until `release_selects`
    pub fn hold_selects(&self) {
        self.selects_open.send_replace(false);
    }

    pub fn release_selects(&self) {
        self.selects_open.send_replace(true);
    }

    /// Make every write fail with a remote error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes that have reached the store, held or not
    pub fn writes_seen(&self) -> usize {
        *self.writes_seen.borrow()
    }

    /// Selects that have reached the store, held or not
    pub fn selects_seen(&self) -> usize {
        *self.selects_seen.borrow()
    }

    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.writes_seen.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    pub async fn wait_for_selects(&self, count: usize) {
        let mut rx = self.selects_seen.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    async fn gate_write(&self) -> LedgerResult<()> {
        self.writes_seen.send_modify(|seen| *seen += 1);
        let mut open = self.writes_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Remote("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for GatedStore {
    async fn insert(&self, table: &str, row: Record) -> LedgerResult<Record> {
        self.gate_write().await?;
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> LedgerResult<Record> {
        self.gate_write().await?;
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: &str, id: &str) -> LedgerResult<()> {
        self.gate_write().await?;
        self.inner.delete(table, id).await
    }

    async fn select(&self, table: &str, owner_id: &str) -> LedgerResult<Vec<Record>> {
        self.selects_seen.send_modify(|seen| *seen += 1);
        let mut open = self.selects_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.inner.select(table, owner_id).await
    }

    async fn subscribe(&self, table: &str, owner_id: &str) -> LedgerResult<ChangeFeed> {
        self.inner.subscribe(table, owner_id).await
    }
}
