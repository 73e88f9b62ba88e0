//! In-process row store

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeEvent, ChangeFeed, ChangeKind, RemoteStore};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{record_id, Record, ID_COLUMN, OWNER_COLUMN};

/// All rows, keyed by table name, in insertion order
pub type Tables = BTreeMap<String, Vec<Record>>;

struct Subscriber {
    table: String,
    owner_id: String,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Row store held entirely in memory
///
/// Assigns uuid ids and `created_at` on insert, scopes selects and feeds
/// by the `user_id` column.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding existing rows
    pub fn with_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Copy of every table
    pub fn snapshot(&self) -> LedgerResult<Tables> {
        Ok(self.read()?.clone())
    }

    /// Swap in `tables` wholesale, without publishing events
    pub(crate) fn replace_tables(&self, tables: Tables) -> LedgerResult<()> {
        *self.write()? = tables;
        Ok(())
    }

    /// Store rows as-is, without assigning columns or publishing events
    pub fn seed(&self, table: &str, rows: Vec<Record>) -> LedgerResult<()> {
        self.write()?.entry(table.to_string()).or_default().extend(rows);
        Ok(())
    }

    /// Drop every change feed, as a lost connection would
    pub fn disconnect_all(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            debug!(count = subscribers.len(), "disconnecting change feeds");
            subscribers.clear();
        }
    }

    /// Number of open change feeds
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subscribers| {
                subscribers.retain(|s| !s.tx.is_closed());
                subscribers.len()
            })
            .unwrap_or(0)
    }

    fn read(&self) -> LedgerResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| LedgerError::Storage(format!("Failed to acquire store lock: {}", e)))
    }

    fn write(&self) -> LedgerResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| LedgerError::Storage(format!("Failed to acquire store lock: {}", e)))
    }

    /// Send `event` to every feed watching its table and owner
    pub(crate) fn publish(&self, event: ChangeEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers
            .iter()
            .filter(|s| s.table == event.table && s.owner_id == event.owner_id)
        {
            let _ = subscriber.tx.send(event.clone());
        }
    }
}

fn owner_of(row: &Record) -> Option<String> {
    row.get(OWNER_COLUMN).and_then(Value::as_str).map(str::to_string)
}

fn row_missing(table: &str, id: &str) -> LedgerError {
    LedgerError::Remote(format!("No row {} in {}", id, table))
}

impl MemoryStore {
    /// Insert without publishing; returns the stored row and its event
    pub(crate) fn apply_insert(&self, table: &str, mut row: Record) -> LedgerResult<(Record, ChangeEvent)> {
        let owner_id = owner_of(&row)
            .ok_or_else(|| LedgerError::Remote(format!("Row for {} has no {}", table, OWNER_COLUMN)))?;

        if record_id(&row).is_none() {
            row.insert(ID_COLUMN.into(), Value::String(Uuid::new_v4().to_string()));
        }
        row.entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

        let mut tables = self.write()?;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| record_id(r) == record_id(&row)) {
            return Err(LedgerError::Remote(format!(
                "Duplicate id in {}: {}",
                table,
                record_id(&row).unwrap_or_default()
            )));
        }
        rows.push(row.clone());

        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            owner_id,
            new: Some(row.clone()),
            old: None,
        };
        Ok((row, event))
    }

    /// Merge `patch` into row `id` without publishing
    pub(crate) fn apply_update(&self, table: &str, id: &str, patch: Record) -> LedgerResult<(Record, ChangeEvent)> {
        let mut tables = self.write()?;
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| record_id(r) == Some(id)))
            .ok_or_else(|| row_missing(table, id))?;

        let old = row.clone();
        for (column, value) in patch {
            if column != ID_COLUMN {
                row.insert(column, value);
            }
        }
        row.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
        let new = row.clone();

        let event = ChangeEvent {
            kind: ChangeKind::Update,
            table: table.to_string(),
            owner_id: owner_of(&new).unwrap_or_default(),
            new: Some(new.clone()),
            old: Some(old),
        };
        Ok((new, event))
    }

    /// Remove row `id` without publishing
    pub(crate) fn apply_delete(&self, table: &str, id: &str) -> LedgerResult<ChangeEvent> {
        let mut tables = self.write()?;
        let rows = tables.get_mut(table).ok_or_else(|| row_missing(table, id))?;
        let index = rows
            .iter()
            .position(|r| record_id(r) == Some(id))
            .ok_or_else(|| row_missing(table, id))?;
        let old = rows.remove(index);

        Ok(ChangeEvent {
            kind: ChangeKind::Delete,
            table: table.to_string(),
            owner_id: owner_of(&old).unwrap_or_default(),
            new: None,
            old: Some(old),
        })
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn insert(&self, table: &str, row: Record) -> LedgerResult<Record> {
        let (saved, event) = self.apply_insert(table, row)?;
        self.publish(event);
        Ok(saved)
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> LedgerResult<Record> {
        let (saved, event) = self.apply_update(table, id, patch)?;
        self.publish(event);
        Ok(saved)
    }

    async fn delete(&self, table: &str, id: &str) -> LedgerResult<()> {
        let event = self.apply_delete(table, id)?;
        self.publish(event);
        Ok(())
    }

    async fn select(&self, table: &str, owner_id: &str) -> LedgerResult<Vec<Record>> {
        let tables = self.read()?;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .rev()
                    .filter(|r| owner_of(r).as_deref() == Some(owner_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(&self, table: &str, owner_id: &str) -> LedgerResult<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Failed to acquire subscriber lock: {}", e)))?
            .push(Subscriber {
                table: table.to_string(),
                owner_id: owner_id.to_string(),
                tx,
            });
        debug!(table, "change feed opened");
        Ok(ChangeFeed::new(rx))
    }
}
