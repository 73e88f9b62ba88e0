//! Optimistic create/update/delete
//!
//! Each mutation follows the same protocol:
//!
//! 1. register with the cache, which cancels any in-flight refresh of the
//!    collection and defers new ones
//! 2. apply the change to the cached list and keep a snapshot of what it
//!    replaced
//! 3. encrypt and send the write
//! 4. on failure restore the snapshot, touching only the affected record
//! 5. settle, which triggers one refresh, and wait for it
//!
//! Because rollback is per record, concurrent mutations on the same list
//! never undo each other.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::cache::{CollectionKey, PendingMutation};
use super::SyncContext;
use crate::error::{LedgerError, LedgerResult};
use crate::models::category::category_summary;
use crate::models::ids::provisional_id;
use crate::models::{
    record_id, EntityInput, GoalInput, OperationId, Record, DELETED_COLUMN, ID_COLUMN,
    OWNER_COLUMN,
};

/// Lifecycle of a single mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Idle,
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A cached record as it was before a mutation touched it
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub record: Record,
    pub index: usize,
}

/// Bookkeeping for one in-flight mutation
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub operation_id: OperationId,
    pub kind: MutationKind,
    pub record_id: String,
    /// Record shown while the write is in flight (absent for deletes)
    pub optimistic: Option<Record>,
    /// What a rollback restores (absent for creates and unloaded records)
    pub rollback: Option<Snapshot>,
    pub state: MutationState,
}

/// Optimistic writer for one entity type and owner
pub struct MutationCoordinator<I> {
    ctx: SyncContext,
    owner_id: String,
    log: Arc<Mutex<Vec<MutationRecord>>>,
    _input: PhantomData<fn(I)>,
}

impl<I> Clone for MutationCoordinator<I> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            owner_id: self.owner_id.clone(),
            log: Arc::clone(&self.log),
            _input: PhantomData,
        }
    }
}

impl<I: EntityInput> MutationCoordinator<I> {
    pub fn new(ctx: SyncContext, owner_id: impl Into<String>) -> Self {
        Self {
            ctx,
            owner_id: owner_id.into(),
            log: Arc::new(Mutex::new(Vec::new())),
            _input: PhantomData,
        }
    }

    /// The cached collection this coordinator writes to
    pub fn key(&self) -> CollectionKey {
        CollectionKey::new(I::ENTITY, self.owner_id.clone())
    }

    /// Mutations that have not settled yet
    pub fn pending(&self) -> Vec<MutationRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Create a record
    ///
    /// A provisional record with a temporary id is shown at the head of the
    /// list until the store confirms the write. Returns the stored record
    /// in plaintext.
    pub async fn create(&self, input: I) -> LedgerResult<Record> {
        input.validate()?;
        self.ctx.codec.keys().current_key()?;

        let mut row = input.to_record()?;
        row.insert(OWNER_COLUMN.into(), Value::String(self.owner_id.clone()));

        let temp_id = provisional_id(&self.ctx.temp_id_prefix);
        let mut optimistic = row.clone();
        optimistic.insert(ID_COLUMN.into(), Value::String(temp_id.clone()));
        optimistic.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        self.denormalize(&mut optimistic, input.category_id());

        let key = self.key();
        let pending = self.ctx.cache.begin_mutation(&key);
        let operation = self.track(MutationKind::Create, &temp_id, Some(optimistic.clone()), None);
        let was_loaded = self.ctx.cache.is_loaded(&key);
        self.ctx.cache.modify(&key, |records| records.insert(0, optimistic));
        self.transition(operation, MutationState::Pending);

        let result = async {
            let sealed = self.ctx.codec.encrypt_entity(&row, I::ENTITY).await?;
            self.ctx.store.insert(I::ENTITY.table(), sealed).await
        }
        .await;

        let result = match result {
            Ok(saved) => {
                info!(entity = %I::ENTITY, id = record_id(&saved).unwrap_or_default(), "created");
                self.transition(operation, MutationState::Committed);
                Ok(self.view(saved, input.category_id()).await)
            }
            Err(e) => {
                self.ctx.cache.modify_loaded(&key, |records| {
                    records.retain(|r| record_id(r) != Some(temp_id.as_str()))
                });
                if !was_loaded {
                    self.ctx.cache.unload_if_empty(&key);
                }
                warn!(entity = %I::ENTITY, "create rolled back: {}", e);
                self.transition(operation, MutationState::RolledBack);
                Err(e)
            }
        };

        self.settle(operation, pending).await;
        result
    }

    /// Replace the fields of record `id` with `input`
    pub async fn update(&self, id: &str, input: I) -> LedgerResult<Record> {
        input.validate()?;
        let patch = input.to_record()?;
        let mut display = patch.clone();
        self.denormalize(&mut display, input.category_id());
        self.apply_update(id, patch, display).await
    }

    /// Delete record `id`
    ///
    /// Soft-deleting entity types are flagged rather than removed.
    pub async fn delete(&self, id: &str) -> LedgerResult<()> {
        self.reject_provisional(id)?;
        self.ctx.codec.keys().current_key()?;

        let key = self.key();
        let pending = self.ctx.cache.begin_mutation(&key);
        let snapshot = self
            .ctx
            .cache
            .modify_loaded(&key, |records| {
                let index = records.iter().position(|r| record_id(r) == Some(id))?;
                Some(Snapshot {
                    record: records.remove(index),
                    index,
                })
            })
            .flatten();
        let operation = self.track(MutationKind::Delete, id, None, snapshot.clone());
        self.transition(operation, MutationState::Pending);

        let table = I::ENTITY.table();
        let result = if I::ENTITY.soft_deletes() {
            let mut flag = Record::new();
            flag.insert(DELETED_COLUMN.into(), Value::Bool(true));
            self.ctx.store.update(table, id, flag).await.map(|_| ())
        } else {
            self.ctx.store.delete(table, id).await
        };

        match &result {
            Ok(()) => {
                info!(entity = %I::ENTITY, id, "deleted");
                self.transition(operation, MutationState::Committed);
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.ctx.cache.modify_loaded(&key, |records| {
                        let index = snapshot.index.min(records.len());
                        records.insert(index, snapshot.record);
                    });
                }
                warn!(entity = %I::ENTITY, id, "delete rolled back: {}", e);
                self.transition(operation, MutationState::RolledBack);
            }
        }

        self.settle(operation, pending).await;
        result
    }

    async fn apply_update(&self, id: &str, patch: Record, display: Record) -> LedgerResult<Record> {
        self.reject_provisional(id)?;
        self.ctx.codec.keys().current_key()?;

        let key = self.key();
        let pending = self.ctx.cache.begin_mutation(&key);
        let edited = self
            .ctx
            .cache
            .modify_loaded(&key, |records| {
                let index = records.iter().position(|r| record_id(r) == Some(id))?;
                let previous = records[index].clone();
                for (column, value) in display {
                    records[index].insert(column, value);
                }
                Some((
                    records[index].clone(),
                    Snapshot {
                        record: previous,
                        index,
                    },
                ))
            })
            .flatten();
        let (optimistic, snapshot) = match edited {
            Some((record, snapshot)) => (Some(record), Some(snapshot)),
            None => (None, None),
        };
        let operation = self.track(MutationKind::Update, id, optimistic, snapshot.clone());
        self.transition(operation, MutationState::Pending);

        let result = async {
            let sealed = self.ctx.codec.encrypt_entity(&patch, I::ENTITY).await?;
            self.ctx.store.update(I::ENTITY.table(), id, sealed).await
        }
        .await;

        let result = match result {
            Ok(saved) => {
                info!(entity = %I::ENTITY, id, "updated");
                self.transition(operation, MutationState::Committed);
                let category = saved
                    .get("category_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(self.view(saved, category.as_deref()).await)
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.ctx.cache.modify_loaded(&key, |records| {
                        if let Some(current) = records.iter_mut().find(|r| record_id(r) == Some(id)) {
                            *current = snapshot.record;
                        }
                    });
                }
                warn!(entity = %I::ENTITY, id, "update rolled back: {}", e);
                self.transition(operation, MutationState::RolledBack);
                Err(e)
            }
        };

        self.settle(operation, pending).await;
        result
    }

    fn reject_provisional(&self, id: &str) -> LedgerResult<()> {
        if id.starts_with(&self.ctx.temp_id_prefix) {
            return Err(LedgerError::Validation(format!(
                "{} {} has not been saved yet",
                I::ENTITY,
                id
            )));
        }
        Ok(())
    }

    fn denormalize(&self, record: &mut Record, category_id: Option<&str>) {
        if !I::ENTITY.has_category() {
            return;
        }
        let summary = self
            .ctx
            .categories
            .read()
            .map(|categories| category_summary(&categories, category_id))
            .unwrap_or(Value::Null);
        record.insert("category".into(), summary);
    }

    /// Plaintext form of a stored row for returning to the caller
    async fn view(&self, saved: Record, category_id: Option<&str>) -> Record {
        let mut view = match self.ctx.codec.decrypt_entity(saved.clone(), I::ENTITY).await {
            Ok(view) => view,
            Err(_) => saved,
        };
        self.denormalize(&mut view, category_id);
        view
    }

    async fn settle(&self, operation: OperationId, pending: PendingMutation) {
        if let Err(e) = pending.settle().wait().await {
            debug!(entity = %I::ENTITY, %operation, "settlement refresh failed: {}", e);
        }
        if let Ok(mut log) = self.log.lock() {
            log.retain(|m| m.operation_id != operation);
        }
    }

    fn track(
        &self,
        kind: MutationKind,
        record_id: &str,
        optimistic: Option<Record>,
        rollback: Option<Snapshot>,
    ) -> OperationId {
        let operation_id = OperationId::new();
        if let Ok(mut log) = self.log.lock() {
            log.push(MutationRecord {
                operation_id,
                kind,
                record_id: record_id.to_string(),
                optimistic,
                rollback,
                state: MutationState::Idle,
            });
        }
        operation_id
    }

    fn transition(&self, operation: OperationId, state: MutationState) {
        if let Ok(mut log) = self.log.lock() {
            if let Some(record) = log.iter_mut().find(|m| m.operation_id == operation) {
                record.state = state;
            }
        }
    }
}

impl MutationCoordinator<GoalInput> {
    /// Add `amount` to a goal's saved total
    ///
    /// Marks the goal completed once the total reaches its target. The goal
    /// must be in the cached list.
    pub async fn contribute(&self, id: &str, amount: f64) -> LedgerResult<Record> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::Validation(format!(
                "Contribution must be a positive amount, got {}",
                amount
            )));
        }

        let goal = self
            .ctx
            .cache
            .get(&self.key())
            .and_then(|records| records.into_iter().find(|r| record_id(r) == Some(id)))
            .ok_or_else(|| LedgerError::not_found("Goal", id))?;

        let saved = number_field(&goal, "current_amount") + amount;
        let completed = saved >= number_field(&goal, "target_amount");

        let mut patch = Record::new();
        patch.insert("current_amount".into(), json!(saved));
        patch.insert("is_completed".into(), Value::Bool(completed));
        if completed {
            info!(id, "goal reached");
        }
        self.apply_update(id, patch.clone(), patch).await
    }
}

fn number_field(record: &Record, field: &str) -> f64 {
    match record.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    use chrono::NaiveDate;

    use crate::crypto::{is_envelope, EntityCodec, EnvelopeCodec, KeyManager};
    use crate::models::{BudgetInput, Category, EntityType, TransactionInput, TransactionKind};
    use crate::storage::testing::GatedStore;
    use crate::storage::RemoteStore;
    use crate::sync::cache::{QueryCache, RemoteFetcher};

    fn setup() -> (Arc<GatedStore>, SyncContext) {
        crate::logging::init_test_tracing();
        let store = Arc::new(GatedStore::new());
        let keys = Arc::new(KeyManager::new("-test-salt"));
        keys.initialize("u1").unwrap();
        let codec = EntityCodec::new(keys, EnvelopeCodec::default());
        let remote: Arc<dyn RemoteStore> = store.clone();
        let categories = Arc::new(RwLock::new(vec![
            Category::new("c1", "Food").with_color("#FF0000")
        ]));
        let cache = QueryCache::new(Arc::new(RemoteFetcher::new(
            remote.clone(),
            codec.clone(),
            Arc::clone(&categories),
        )));
        let ctx = SyncContext {
            store: remote,
            codec,
            cache,
            categories,
            temp_id_prefix: "temp-".into(),
        };
        (store, ctx)
    }

    fn lunch() -> TransactionInput {
        TransactionInput::new(
            "42.00",
            TransactionKind::Expense,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        )
        .with_description("Lunch")
        .with_category("c1")
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| record_id(r).unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_create_shows_provisional_then_saved() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();
        ctx.cache.invalidate(&key).wait().await.unwrap();

        store.hold_writes();
        let task = tokio::spawn({
            let transactions = transactions.clone();
            async move { transactions.create(lunch()).await }
        });
        store.wait_for_writes(1).await;

        let visible = ctx.cache.get(&key).unwrap();
        assert_eq!(visible.len(), 1);
        assert!(record_id(&visible[0]).unwrap().starts_with("temp-"));
        assert_eq!(visible[0]["amount"], json!("42.00"));
        assert_eq!(visible[0]["category"], json!({"name": "Food", "color": "#FF0000"}));

        let pending = transactions.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Create);
        assert_eq!(pending[0].state, MutationState::Pending);

        store.release_writes();
        let saved = task.await.unwrap().unwrap();
        let id = record_id(&saved).unwrap().to_string();
        assert_eq!(saved["description"], json!("Lunch"));

        let settled = ctx.cache.get(&key).unwrap();
        assert_eq!(ids(&settled), [id]);
        assert_eq!(settled[0]["amount"].as_f64(), Some(42.0));
        assert!(transactions.pending().is_empty());

        let rows = store.inner.select("transactions", "u1").await.unwrap();
        assert!(is_envelope(rows[0]["amount"].as_str().unwrap()));
        assert!(is_envelope(rows[0]["description"].as_str().unwrap()));
        assert_eq!(rows[0]["type"], json!("expense"));
    }

    #[tokio::test]
    async fn test_failed_create_restores_list_exactly() {
        let (store, ctx) = setup();
        store
            .inner
            .seed(
                "transactions",
                vec![json!({"id": "old", "user_id": "u1", "amount": "5.00", "description": "Legacy"})
                    .as_object()
                    .cloned()
                    .unwrap()],
            )
            .unwrap();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();
        ctx.cache.invalidate(&key).wait().await.unwrap();
        let before = ctx.cache.get(&key).unwrap();

        store.hold_writes();
        store.fail_writes(true);
        let task = tokio::spawn({
            let transactions = transactions.clone();
            async move { transactions.create(lunch()).await }
        });
        store.wait_for_writes(1).await;

        let visible = ctx.cache.get(&key).unwrap();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0]["amount"], json!("42.00"));
        assert_eq!(visible[1], before[0]);

        store.hold_selects();
        store.release_writes();
        store.wait_for_selects(2).await;
        assert_eq!(ctx.cache.get(&key).unwrap(), before);

        store.release_selects();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_remote());
        assert_eq!(ctx.cache.get(&key).unwrap(), before);
        assert!(transactions.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_on_unloaded_list_stays_unloaded() {
        let (store, ctx) = setup();
        store
            .inner
            .seed(
                "transactions",
                vec![json!({"id": "old", "user_id": "u1", "amount": "5.00"})
                    .as_object()
                    .cloned()
                    .unwrap()],
            )
            .unwrap();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();

        store.hold_writes();
        store.fail_writes(true);
        let task = tokio::spawn({
            let transactions = transactions.clone();
            async move { transactions.create(lunch()).await }
        });
        store.wait_for_writes(1).await;
        assert_eq!(ctx.cache.get(&key).unwrap().len(), 1);

        // the settlement refresh cannot decrypt without a key
        ctx.codec.keys().clear();
        store.release_writes();
        assert!(task.await.unwrap().unwrap_err().is_remote());
        assert!(ctx.cache.get(&key).is_none());

        ctx.codec.keys().initialize("u1").unwrap();
        assert_eq!(ids(&ctx.cache.load(&key).await.unwrap()), ["old"]);
    }

    #[tokio::test]
    async fn test_update_of_unloaded_list_is_not_cached() {
        let (store, ctx) = setup();
        store
            .inner
            .seed(
                "budgets",
                vec![json!({"id": "b1", "user_id": "u1", "amount": "10", "month": 1, "year": 2024})
                    .as_object()
                    .cloned()
                    .unwrap()],
            )
            .unwrap();
        let budgets = MutationCoordinator::<BudgetInput>::new(ctx.clone(), "u1");
        let key = budgets.key();

        store.hold_writes();
        let task = tokio::spawn({
            let budgets = budgets.clone();
            async move { budgets.update("b1", BudgetInput::new("20", 1, 2024)).await }
        });
        store.wait_for_writes(1).await;
        assert!(ctx.cache.get(&key).is_none());
        assert!(budgets.pending()[0].rollback.is_none());

        store.release_writes();
        task.await.unwrap().unwrap();
        let settled = ctx.cache.get(&key).unwrap();
        assert_eq!(settled[0]["amount"].as_f64(), Some(20.0));
    }

    #[tokio::test]
    async fn test_category_join_follows_the_input() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();
        let saved = transactions.create(lunch()).await.unwrap();
        let id = record_id(&saved).unwrap().to_string();

        let food = json!({"name": "Food", "color": "#FF0000"});
        assert_eq!(ctx.cache.get(&key).unwrap()[0]["category"], food);

        let uncategorized = TransactionInput::new(
            "42.00",
            TransactionKind::Expense,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        );
        let writes_before = store.writes_seen();
        store.hold_writes();
        let task = tokio::spawn({
            let transactions = transactions.clone();
            let id = id.clone();
            async move { transactions.update(&id, uncategorized).await }
        });
        store.wait_for_writes(writes_before + 1).await;
        assert_eq!(ctx.cache.get(&key).unwrap()[0]["category"], Value::Null);

        store.release_writes();
        let updated = task.await.unwrap().unwrap();
        assert_eq!(updated["category"], Value::Null);
        assert_eq!(ctx.cache.get(&key).unwrap()[0]["category"], Value::Null);
    }

    #[tokio::test]
    async fn test_concurrent_creates_keep_distinct_provisionals() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();
        ctx.cache.invalidate(&key).wait().await.unwrap();

        store.hold_writes();
        let tasks: Vec<_> = ["coffee", "rent"]
            .into_iter()
            .map(|description| {
                let transactions = transactions.clone();
                tokio::spawn(async move {
                    let input = lunch().with_description(description);
                    transactions.create(input).await
                })
            })
            .collect();
        store.wait_for_writes(2).await;

        let visible = ids(&ctx.cache.get(&key).unwrap());
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|id| id.starts_with("temp-")));
        assert_ne!(visible[0], visible[1]);
        assert_eq!(transactions.pending().len(), 2);

        store.release_writes();
        let mut saved = Vec::new();
        for task in tasks {
            saved.push(record_id(&task.await.unwrap().unwrap()).unwrap().to_string());
        }

        let mut cached = ids(&ctx.cache.get(&key).unwrap());
        cached.sort();
        saved.sort();
        assert_eq!(cached, saved);
    }

    #[tokio::test]
    async fn test_failed_update_restores_record() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();
        let saved = transactions.create(lunch()).await.unwrap();
        let id = record_id(&saved).unwrap().to_string();
        let before = ctx.cache.get(&key).unwrap();

        let writes_before = store.writes_seen();
        store.hold_writes();
        store.fail_writes(true);
        let task = tokio::spawn({
            let transactions = transactions.clone();
            let id = id.clone();
            async move { transactions.update(&id, lunch().with_description("Dinner")).await }
        });
        store.wait_for_writes(writes_before + 1).await;
        assert_eq!(ctx.cache.get(&key).unwrap()[0]["description"], json!("Dinner"));

        store.release_writes();
        assert!(task.await.unwrap().is_err());
        assert_eq!(ctx.cache.get(&key).unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_commits() {
        let (_store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let saved = transactions.create(lunch()).await.unwrap();
        let id = record_id(&saved).unwrap().to_string();

        let updated = transactions
            .update(&id, lunch().with_description("Dinner"))
            .await
            .unwrap();
        assert_eq!(updated["description"], json!("Dinner"));
        assert_eq!(
            ctx.cache.get(&transactions.key()).unwrap()[0]["description"],
            json!("Dinner")
        );
    }

    #[tokio::test]
    async fn test_transaction_delete_is_soft() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let saved = transactions.create(lunch()).await.unwrap();
        let id = record_id(&saved).unwrap().to_string();

        transactions.delete(&id).await.unwrap();

        assert!(ctx.cache.get(&transactions.key()).unwrap().is_empty());
        let rows = store.inner.select("transactions", "u1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][DELETED_COLUMN], json!(true));
    }

    #[tokio::test]
    async fn test_failed_delete_restores_position() {
        let (store, ctx) = setup();
        let budgets = MutationCoordinator::<BudgetInput>::new(ctx.clone(), "u1");
        for amount in ["100", "200", "300"] {
            budgets.create(BudgetInput::new(amount, 5, 2024)).await.unwrap();
        }
        let key = budgets.key();
        let before = ctx.cache.get(&key).unwrap();
        let middle = record_id(&before[1]).unwrap().to_string();

        let writes_before = store.writes_seen();
        store.hold_writes();
        store.fail_writes(true);
        let task = tokio::spawn({
            let budgets = budgets.clone();
            let middle = middle.clone();
            async move { budgets.delete(&middle).await }
        });
        store.wait_for_writes(writes_before + 1).await;
        assert!(!ids(&ctx.cache.get(&key).unwrap()).contains(&middle));

        store.release_writes();
        assert!(task.await.unwrap().is_err());
        assert_eq!(ctx.cache.get(&key).unwrap(), before);
        assert_eq!(store.inner.select("budgets", "u1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_budget_delete_is_hard() {
        let (store, ctx) = setup();
        let budgets = MutationCoordinator::<BudgetInput>::new(ctx.clone(), "u1");
        let saved = budgets.create(BudgetInput::new("250", 1, 2025)).await.unwrap();
        budgets.delete(record_id(&saved).unwrap()).await.unwrap();
        assert!(store.inner.select("budgets", "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contribute_completes_goal() {
        let (_store, ctx) = setup();
        let goals = MutationCoordinator::<GoalInput>::new(ctx.clone(), "u1");
        let saved = goals.create(GoalInput::new("Car", "100")).await.unwrap();
        let id = record_id(&saved).unwrap().to_string();

        let partial = goals.contribute(&id, 60.0).await.unwrap();
        assert_eq!(partial["current_amount"].as_f64(), Some(60.0));
        assert_eq!(partial["is_completed"], json!(false));

        let done = goals.contribute(&id, 40.0).await.unwrap();
        assert_eq!(done["is_completed"], json!(true));
        assert_eq!(done["name"], json!("Car"));

        let cached = ctx.cache.get(&goals.key()).unwrap();
        assert_eq!(cached[0]["current_amount"].as_f64(), Some(100.0));
        assert_eq!(cached[0]["is_completed"], json!(true));
    }

    #[tokio::test]
    async fn test_contribute_rejects_bad_input() {
        let (_store, ctx) = setup();
        let goals = MutationCoordinator::<GoalInput>::new(ctx, "u1");
        assert!(matches!(
            goals.contribute("g1", -5.0).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(goals.contribute("missing", 5.0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_provisional_ids_cannot_be_edited() {
        let (_store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx, "u1");
        assert!(matches!(
            transactions.delete("temp-123").await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            transactions.update("temp-123", lunch()).await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_before_any_optimistic_change() {
        let (store, ctx) = setup();
        let transactions = MutationCoordinator::<TransactionInput>::new(ctx.clone(), "u1");
        let key = transactions.key();

        let bad = TransactionInput::new("lots", TransactionKind::Income, NaiveDate::MIN);
        assert!(matches!(
            transactions.create(bad).await,
            Err(LedgerError::Validation(_))
        ));

        ctx.codec.keys().clear();
        assert!(matches!(
            transactions.create(lunch()).await,
            Err(LedgerError::NotInitialized)
        ));

        assert!(ctx.cache.get(&key).is_none());
        assert_eq!(store.writes_seen(), 0);
        assert_eq!(ctx.cache.pending_mutations(&key), 0);
    }

    #[test]
    fn test_number_field() {
        let record = json!({"a": 12.5, "b": "7", "c": null})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(number_field(&record, "a"), 12.5);
        assert_eq!(number_field(&record, "b"), 7.0);
        assert_eq!(number_field(&record, "c"), 0.0);
        assert_eq!(number_field(&record, "missing"), 0.0);
    }

    #[test]
    fn test_entity_of_coordinator() {
        let (_store, ctx) = setup();
        let goals = MutationCoordinator::<GoalInput>::new(ctx, "u1");
        assert_eq!(goals.key(), CollectionKey::new(EntityType::Goal, "u1"));
    }
}
