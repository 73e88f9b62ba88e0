//! Change feed subscriptions
//!
//! A [`SubscriptionHandle`] owns a background task that drains one change
//! feed and dispatches each event to its handlers. Tearing the handle down
//! is deterministic: once `unsubscribe` returns, no handler runs again.
//! Lost connections are not retried; events simply stop until the caller
//! resubscribes.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::debug;

use super::cache::{CollectionKey, QueryCache};
use crate::error::LedgerResult;
use crate::models::EntityType;
use crate::storage::{ChangeEvent, ChangeFeed, ChangeKind, RemoteStore};

/// Callback invoked for a change event
pub type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callbacks for a spawned subscription
///
/// The kind-specific handler runs first, then `on_change`.
#[derive(Clone, Default)]
pub struct ChangeHandlers {
    on_insert: Option<Handler>,
    on_update: Option<Handler>,
    on_delete: Option<Handler>,
    on_change: Option<Handler>,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(handler));
        self
    }

    pub fn on_update(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(handler));
        self
    }

    pub fn on_delete(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(handler));
        self
    }

    /// Runs for every event, after the kind-specific handler
    pub fn on_change(mut self, handler: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(handler));
        self
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let specific = match event.kind {
            ChangeKind::Insert => &self.on_insert,
            ChangeKind::Update => &self.on_update,
            ChangeKind::Delete => &self.on_delete,
        };
        if let Some(handler) = specific {
            handler(event);
        }
        if let Some(handler) = &self.on_change {
            handler(event);
        }
    }
}

impl fmt::Debug for ChangeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHandlers")
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

/// Handlers that invalidate one cached collection on every event
pub fn invalidate_on_change(cache: QueryCache, entity: EntityType, owner_id: &str) -> ChangeHandlers {
    let key = CollectionKey::new(entity, owner_id);
    ChangeHandlers::new().on_change(move |event| {
        debug!(table = %event.table, kind = ?event.kind, "remote change");
        let _ = cache.invalidate(&key);
    })
}

/// Opens change feeds on a store
#[derive(Clone)]
pub struct ChangeSubscriber {
    store: Arc<dyn RemoteStore>,
}

impl ChangeSubscriber {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Open a pull-based subscription to `table` rows owned by `owner_id`
    pub async fn subscribe(&self, table: &str, owner_id: &str) -> LedgerResult<Subscription> {
        let feed = self.store.subscribe(table, owner_id).await?;
        Ok(Subscription {
            table: table.to_string(),
            owner_id: owner_id.to_string(),
            feed,
        })
    }

    /// Subscribe and dispatch events to `handlers` from a background task
    pub async fn spawn(
        &self,
        table: &str,
        owner_id: &str,
        handlers: ChangeHandlers,
    ) -> LedgerResult<SubscriptionHandle> {
        let mut handle = SubscriptionHandle {
            subscriber: self.clone(),
            table: table.to_string(),
            owner_id: owner_id.to_string(),
            handlers,
            active: Arc::new(Mutex::new(false)),
            task: None,
        };
        handle.start().await?;
        Ok(handle)
    }
}

/// A pull-based change stream for one (table, owner) pair
#[derive(Debug)]
pub struct Subscription {
    table: String,
    owner_id: String,
    feed: ChangeFeed,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Next event, or `None` once the feed is closed or disconnected
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.feed.recv().await
    }

    /// Stop receiving events
    pub fn close(&mut self) {
        self.feed.close();
    }
}

/// A running subscription; unsubscribes on drop
pub struct SubscriptionHandle {
    subscriber: ChangeSubscriber,
    table: String,
    owner_id: String,
    handlers: ChangeHandlers,
    /// Checked under lock before every dispatch
    active: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Whether events are still being dispatched
    ///
    /// Turns false after `unsubscribe` or once the feed disconnects.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
            && self.active.lock().map(|active| *active).unwrap_or(false)
    }

    /// Stop dispatching events
    ///
    /// Idempotent. Handlers must not call this on their own handle.
    pub fn unsubscribe(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
        task.abort();
        debug!(table = %self.table, "unsubscribed");
    }

    /// Tear down the current feed and subscribe again for `owner_id`
    pub async fn resubscribe(&mut self, owner_id: &str) -> LedgerResult<()> {
        self.unsubscribe();
        self.owner_id = owner_id.to_string();
        self.start().await
    }

    async fn start(&mut self) -> LedgerResult<()> {
        let mut subscription = self.subscriber.subscribe(&self.table, &self.owner_id).await?;
        let active = Arc::new(Mutex::new(true));
        let handlers = self.handlers.clone();
        let gate = Arc::clone(&active);

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if !dispatch_if_open(&gate, &handlers, &event) {
                    break;
                }
            }
            debug!(table = %subscription.table(), "change feed closed");
        });

        self.active = active;
        self.task = Some(task);
        debug!(table = %self.table, "subscribed");
        Ok(())
    }
}

/// Dispatch under the gate lock; false once the handle is torn down
fn dispatch_if_open(gate: &Mutex<bool>, handlers: &ChangeHandlers, event: &ChangeEvent) -> bool {
    match gate.lock() {
        Ok(open) if *open => {
            handlers.dispatch(event);
            true
        }
        _ => false,
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("table", &self.table)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::models::Record;
    use crate::storage::MemoryStore;

    fn row(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_subscription_yields_events() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let mut subscription = subscriber.subscribe("budgets", "u1").await.unwrap();

        store
            .insert("budgets", row(json!({"id": "b1", "user_id": "u1"})))
            .await
            .unwrap();

        let event = subscription.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(subscription.table(), "budgets");
    }

    #[tokio::test]
    async fn test_handlers_run_in_order() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let specific = tx.clone();
        let handlers = ChangeHandlers::new()
            .on_insert(move |_| {
                let _ = specific.send("insert");
            })
            .on_delete({
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send("delete");
                }
            })
            .on_change(move |_| {
                let _ = tx.send("change");
            });
        let _handle = subscriber.spawn("goals", "u1", handlers).await.unwrap();

        store
            .insert("goals", row(json!({"id": "g1", "user_id": "u1"})))
            .await
            .unwrap();
        store
            .update("goals", "g1", row(json!({"name": "x"})))
            .await
            .unwrap();
        store.delete("goals", "g1").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, ["insert", "change", "change", "delete", "change"]);
    }

    #[tokio::test]
    async fn test_no_handler_after_unsubscribe() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut handle = subscriber
            .spawn(
                "transactions",
                "u1",
                ChangeHandlers::new().on_change(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        assert!(handle.is_active());

        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());

        store
            .insert("transactions", row(json!({"user_id": "u1"})))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let handle = subscriber
            .spawn("budgets", "u1", ChangeHandlers::new())
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(handle);
        tokio::task::yield_now().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_switches_owner() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handle = subscriber
            .spawn(
                "budgets",
                "u1",
                ChangeHandlers::new().on_change(move |event: &ChangeEvent| {
                    let _ = tx.send(event.owner_id.clone());
                }),
            )
            .await
            .unwrap();
        handle.resubscribe("u2").await.unwrap();
        assert_eq!(handle.owner_id(), "u2");

        store.insert("budgets", row(json!({"user_id": "u1"}))).await.unwrap();
        store.insert("budgets", row(json!({"user_id": "u2"}))).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "u2");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_ends_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let subscriber = ChangeSubscriber::new(store.clone());
        let handle = subscriber
            .spawn("goals", "u1", ChangeHandlers::new())
            .await
            .unwrap();

        store.disconnect_all();
        for _ in 0..10 {
            if !handle.is_active() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_active());
    }
}
