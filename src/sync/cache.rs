//! Local collection cache
//!
//! Holds the decrypted record list for each (entity type, owner) pair and
//! schedules refreshes against the remote store.
//!
//! Refresh scheduling per key:
//! - at most one fetch is in flight; invalidations that arrive meanwhile
//!   queue exactly one follow-up fetch
//! - while a mutation is pending on the key, fetches are deferred until
//!   the last pending mutation settles
//! - starting a mutation cancels the in-flight fetch so a stale result can
//!   never overwrite an optimistic write; the cancelled fetch's waiters
//!   move to the next fetch
//!
//! The internal lock is a plain mutex and is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::crypto::EntityCodec;
use crate::error::{LedgerError, LedgerResult};
use crate::models::category::category_summary;
use crate::models::entity::is_soft_deleted;
use crate::models::{Category, EntityType, Record};
use crate::storage::RemoteStore;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Address of one cached list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub entity: EntityType,
    pub owner_id: String,
}

impl CollectionKey {
    pub fn new(entity: EntityType, owner_id: impl Into<String>) -> Self {
        Self {
            entity,
            owner_id: owner_id.into(),
        }
    }
}

/// Loads the authoritative list for a key
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    async fn fetch(&self, key: &CollectionKey) -> LedgerResult<Vec<Record>>;
}

/// Fetches from the remote store and decrypts
///
/// Soft-deleted rows are dropped before decryption. Entity types that
/// reference a category get the `category: {name, color}` join, or null.
pub struct RemoteFetcher {
    store: Arc<dyn RemoteStore>,
    codec: EntityCodec,
    categories: Arc<RwLock<Vec<Category>>>,
}

impl RemoteFetcher {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        codec: EntityCodec,
        categories: Arc<RwLock<Vec<Category>>>,
    ) -> Self {
        Self {
            store,
            codec,
            categories,
        }
    }
}

#[async_trait]
impl CollectionFetcher for RemoteFetcher {
    async fn fetch(&self, key: &CollectionKey) -> LedgerResult<Vec<Record>> {
        let rows = self.store.select(key.entity.table(), &key.owner_id).await?;
        let live: Vec<Record> = rows.into_iter().filter(|r| !is_soft_deleted(r)).collect();
        let mut records = self.codec.decrypt_entities(live, key.entity).await?;

        if key.entity.has_category() {
            let categories = self
                .categories
                .read()
                .map_err(|e| LedgerError::Storage(format!("Failed to read categories: {}", e)))?;
            for record in &mut records {
                let summary = category_summary(
                    &categories,
                    record.get("category_id").and_then(|v| v.as_str()),
                );
                record.insert("category".into(), summary);
            }
        }
        Ok(records)
    }
}

type Waiter = oneshot::Sender<LedgerResult<()>>;

/// Resolves when the refresh it was issued for has completed
#[derive(Debug)]
#[must_use = "a ticket does nothing unless awaited"]
pub struct RefreshTicket {
    rx: oneshot::Receiver<LedgerResult<()>>,
}

impl RefreshTicket {
    /// Wait for the refresh; fails if the fetch failed or the cache was cleared
    pub async fn wait(self) -> LedgerResult<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(LedgerError::Storage("Refresh abandoned".into())))
    }
}

struct InFlight {
    generation: u64,
    abort: AbortHandle,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Entry {
    records: Option<Vec<Record>>,
    in_flight: Option<InFlight>,
    queued: Vec<Waiter>,
    dirty: bool,
    pending_mutations: usize,
    generation: u64,
}

struct Inner {
    entries: Mutex<HashMap<CollectionKey, Entry>>,
    fetcher: Arc<dyn CollectionFetcher>,
    changes: broadcast::Sender<CollectionKey>,
}

/// Shared handle to the collection cache
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(fetcher: Arc<dyn CollectionFetcher>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                fetcher,
                changes,
            }),
        }
    }

    /// Current list for `key`, if it has ever been loaded or written
    pub fn get(&self, key: &CollectionKey) -> Option<Vec<Record>> {
        self.inner
            .lock()
            .ok()?
            .get(key)
            .and_then(|entry| entry.records.clone())
    }

    /// Replace the list for `key`
    pub fn set(&self, key: &CollectionKey, records: Vec<Record>) {
        self.modify(key, |current| *current = records);
    }

    /// Edit the list for `key` in place
    ///
    /// An unloaded key starts from an empty list.
    pub fn modify<R>(&self, key: &CollectionKey, edit: impl FnOnce(&mut Vec<Record>) -> R) -> Option<R> {
        let result = {
            let mut entries = self.inner.lock().ok()?;
            let entry = entries.entry(key.clone()).or_default();
            edit(entry.records.get_or_insert_with(Vec::new))
        };
        let _ = self.inner.changes.send(key.clone());
        Some(result)
    }

    /// Edit the list for `key` only if it has been loaded
    ///
    /// Returns `None` and leaves the key unloaded otherwise.
    pub fn modify_loaded<R>(
        &self,
        key: &CollectionKey,
        edit: impl FnOnce(&mut Vec<Record>) -> R,
    ) -> Option<R> {
        let result = {
            let mut entries = self.inner.lock().ok()?;
            let records = entries.get_mut(key)?.records.as_mut()?;
            edit(records)
        };
        let _ = self.inner.changes.send(key.clone());
        Some(result)
    }

    /// Whether `key` holds a list
    pub fn is_loaded(&self, key: &CollectionKey) -> bool {
        self.inner
            .lock()
            .map(|entries| entries.get(key).is_some_and(|e| e.records.is_some()))
            .unwrap_or(false)
    }

    /// Return `key` to the unloaded state if its list is empty
    ///
    /// Undoes a write that only existed to show a provisional record, so
    /// the next `load` fetches instead of serving an empty list.
    pub fn unload_if_empty(&self, key: &CollectionKey) {
        let unloaded = self
            .inner
            .lock()
            .map(|mut entries| match entries.get_mut(key) {
                Some(entry) if entry.records.as_ref().is_some_and(Vec::is_empty) => {
                    entry.records = None;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if unloaded {
            let _ = self.inner.changes.send(key.clone());
        }
    }

    /// Keys whose list changed, in order of change
    pub fn changes(&self) -> broadcast::Receiver<CollectionKey> {
        self.inner.changes.subscribe()
    }

    /// Mark `key` stale and schedule a refresh
    pub fn invalidate(&self, key: &CollectionKey) -> RefreshTicket {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut entries) = self.inner.lock() {
            let entry = entries.entry(key.clone()).or_default();
            entry.queued.push(tx);
            entry.dirty = true;
            self.inner.pump(key, entry);
        }
        RefreshTicket { rx }
    }

    /// Return the cached list, fetching it first if it was never loaded
    pub async fn load(&self, key: &CollectionKey) -> LedgerResult<Vec<Record>> {
        if let Some(records) = self.get(key) {
            return Ok(records);
        }
        self.invalidate(key).wait().await?;
        Ok(self.get(key).unwrap_or_default())
    }

    /// Abort the in-flight fetch for `key`
    ///
    /// Its waiters are carried over to the next fetch, which starts on the
    /// next invalidation or settlement.
    pub fn cancel_refresh(&self, key: &CollectionKey) {
        if let Ok(mut entries) = self.inner.lock() {
            if let Some(entry) = entries.get_mut(key) {
                cancel(key, entry);
            }
        }
    }

    /// Register a pending mutation on `key`
    ///
    /// Cancels the in-flight fetch and defers refreshes until the returned
    /// guard settles. Dropping the guard settles it.
    pub fn begin_mutation(&self, key: &CollectionKey) -> PendingMutation {
        if let Ok(mut entries) = self.inner.lock() {
            let entry = entries.entry(key.clone()).or_default();
            cancel(key, entry);
            entry.pending_mutations += 1;
        }
        PendingMutation {
            cache: self.clone(),
            key: key.clone(),
            settled: false,
        }
    }

    /// Whether a fetch for `key` is in flight
    pub fn is_refreshing(&self, key: &CollectionKey) -> bool {
        self.inner
            .lock()
            .map(|entries| entries.get(key).is_some_and(|e| e.in_flight.is_some()))
            .unwrap_or(false)
    }

    /// Number of unsettled mutations on `key`
    pub fn pending_mutations(&self, key: &CollectionKey) -> usize {
        self.inner
            .lock()
            .map(|entries| entries.get(key).map_or(0, |e| e.pending_mutations))
            .unwrap_or(0)
    }

    /// Drop every list and abort every fetch
    pub fn clear(&self) {
        if let Ok(mut entries) = self.inner.lock() {
            for entry in entries.values() {
                if let Some(flight) = &entry.in_flight {
                    flight.abort.abort();
                }
            }
            debug!(keys = entries.len(), "cache cleared");
            entries.clear();
        }
    }

    fn settle(&self, key: &CollectionKey) -> RefreshTicket {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut entries) = self.inner.lock() {
            let entry = entries.entry(key.clone()).or_default();
            entry.pending_mutations = entry.pending_mutations.saturating_sub(1);
            entry.queued.push(tx);
            entry.dirty = true;
            self.inner.pump(key, entry);
        }
        RefreshTicket { rx }
    }
}

fn cancel(key: &CollectionKey, entry: &mut Entry) {
    if let Some(flight) = entry.in_flight.take() {
        flight.abort.abort();
        entry.queued.extend(flight.waiters);
        entry.dirty = true;
        debug!(entity = %key.entity, generation = flight.generation, "refresh cancelled");
    }
}

impl Inner {
    fn lock(&self) -> LedgerResult<MutexGuard<'_, HashMap<CollectionKey, Entry>>> {
        self.entries
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Failed to acquire cache lock: {}", e)))
    }

    /// Start a fetch if the key is stale, idle and has no pending mutations
    fn pump(self: &Arc<Self>, key: &CollectionKey, entry: &mut Entry) {
        if entry.in_flight.is_some() || entry.pending_mutations > 0 || !entry.dirty {
            return;
        }

        entry.dirty = false;
        entry.generation += 1;
        let generation = entry.generation;
        let waiters = std::mem::take(&mut entry.queued);

        let inner = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = inner.fetcher.fetch(&task_key).await;
            inner.complete(&task_key, generation, result);
        });

        debug!(entity = %key.entity, generation, "refresh started");
        entry.in_flight = Some(InFlight {
            generation,
            abort: task.abort_handle(),
            waiters,
        });
    }

    fn complete(self: &Arc<Self>, key: &CollectionKey, generation: u64, result: LedgerResult<Vec<Record>>) {
        let updated = {
            let Ok(mut entries) = self.lock() else {
                return;
            };
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            let flight = match entry.in_flight.take() {
                Some(flight) if flight.generation == generation => flight,
                other => {
                    entry.in_flight = other;
                    debug!(entity = %key.entity, generation, "stale refresh discarded");
                    return;
                }
            };

            let outcome = match result {
                Ok(records) => {
                    debug!(entity = %key.entity, generation, count = records.len(), "refresh complete");
                    entry.records = Some(records);
                    Ok(())
                }
                Err(e) => {
                    warn!(entity = %key.entity, "refresh failed: {}", e);
                    Err(e)
                }
            };
            let updated = outcome.is_ok();
            for waiter in flight.waiters {
                let _ = waiter.send(outcome.clone());
            }
            self.pump(key, entry);
            updated
        };

        if updated {
            let _ = self.changes.send(key.clone());
        }
    }
}

/// A mutation registered against a cached key
///
/// Settling releases the deferred refresh. Settling happens once, either
/// explicitly or on drop.
pub struct PendingMutation {
    cache: QueryCache,
    key: CollectionKey,
    settled: bool,
}

impl PendingMutation {
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Release the key and schedule the settlement refresh
    pub fn settle(mut self) -> RefreshTicket {
        self.settled = true;
        self.cache.settle(&self.key)
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.cache.settle(&self.key);
        }
    }
}
