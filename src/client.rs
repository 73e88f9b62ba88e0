//! Session facade
//!
//! Wires the key manager, record codec, cache, coordinators and change
//! subscriptions together for one signed-in user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::info;

use crate::config::Settings;
use crate::crypto::{CoverageCount, EncryptionCoverage, EntityCodec, EnvelopeCodec, KeyManager};
use crate::error::{LedgerError, LedgerResult};
use crate::models::entity::is_soft_deleted;
use crate::models::{
    BudgetInput, Category, EntityInput, EntityType, GoalInput, Record, TransactionInput,
};
use crate::storage::RemoteStore;
use crate::sync::{
    invalidate_on_change, ChangeSubscriber, CollectionKey, MutationCoordinator, QueryCache,
    RemoteFetcher, SubscriptionHandle, SyncContext,
};

struct Session {
    user_id: String,
    watches: HashMap<EntityType, SubscriptionHandle>,
}

/// A sealed-ledger client for one user at a time
pub struct LedgerClient {
    settings: Settings,
    store: Arc<dyn RemoteStore>,
    keys: Arc<KeyManager>,
    codec: EntityCodec,
    cache: QueryCache,
    categories: Arc<RwLock<Vec<Category>>>,
    subscriber: ChangeSubscriber,
    session: Mutex<Option<Session>>,
}

impl LedgerClient {
    /// Create a signed-out client over `store`
    pub fn new(settings: Settings, store: Arc<dyn RemoteStore>) -> LedgerResult<Self> {
        settings.validate()?;
        let keys = Arc::new(KeyManager::new(settings.app_salt.clone()));
        let codec = EntityCodec::new(Arc::clone(&keys), EnvelopeCodec::new(settings.kdf_iterations)?);
        let categories = Arc::new(RwLock::new(Vec::new()));
        let cache = QueryCache::new(Arc::new(RemoteFetcher::new(
            Arc::clone(&store),
            codec.clone(),
            Arc::clone(&categories),
        )));

        Ok(Self {
            subscriber: ChangeSubscriber::new(Arc::clone(&store)),
            settings,
            store,
            keys,
            codec,
            cache,
            categories,
            session: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Start a session for `user_id`, replacing any other user's session
    pub fn login(&self, user_id: &str) -> LedgerResult<()> {
        if self.user_id().ok().as_deref() == Some(user_id) {
            return Ok(());
        }
        if self.is_ready() {
            self.logout();
        }

        self.keys.initialize(user_id)?;
        *self.lock_session()? = Some(Session {
            user_id: user_id.to_string(),
            watches: HashMap::new(),
        });
        info!("signed in");
        Ok(())
    }

    /// End the session: stop subscriptions, drop cached data and the key
    pub fn logout(&self) {
        let session = self.lock_session().ok().and_then(|mut s| s.take());
        drop(session);
        self.cache.clear();
        self.keys.clear();
        info!("signed out");
    }

    /// Whether a user is signed in and their key is loaded
    pub fn is_ready(&self) -> bool {
        self.keys.is_ready() && self.user_id().is_ok()
    }

    /// The signed-in user
    pub fn user_id(&self) -> LedgerResult<String> {
        self.lock_session()?
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or(LedgerError::NotInitialized)
    }

    pub fn transactions(&self) -> LedgerResult<MutationCoordinator<TransactionInput>> {
        self.coordinator()
    }

    pub fn budgets(&self) -> LedgerResult<MutationCoordinator<BudgetInput>> {
        self.coordinator()
    }

    pub fn goals(&self) -> LedgerResult<MutationCoordinator<GoalInput>> {
        self.coordinator()
    }

    /// A coordinator for any entity input type
    pub fn coordinator<I: EntityInput>(&self) -> LedgerResult<MutationCoordinator<I>> {
        Ok(MutationCoordinator::new(self.context(), self.user_id()?))
    }

    /// Decrypted records of `entity`, loading them on first use
    pub async fn list(&self, entity: EntityType) -> LedgerResult<Vec<Record>> {
        self.cache.load(&self.key(entity)?).await
    }

    /// Refetch `entity` from the store
    pub async fn refresh(&self, entity: EntityType) -> LedgerResult<()> {
        self.cache.invalidate(&self.key(entity)?).wait().await
    }

    /// Keep `entity` in sync with remote changes until logout
    pub async fn watch(&self, entity: EntityType) -> LedgerResult<()> {
        let user_id = self.user_id()?;
        let handlers = invalidate_on_change(self.cache.clone(), entity, &user_id);
        let handle = self.subscriber.spawn(entity.table(), &user_id, handlers).await?;

        let mut session = self.lock_session()?;
        match session.as_mut() {
            Some(session) if session.user_id == user_id => {
                session.watches.insert(entity, handle);
                Ok(())
            }
            // signed out or switched user while subscribing
            _ => Err(LedgerError::NotInitialized),
        }
    }

    /// Stop following remote changes to `entity`
    pub fn unwatch(&self, entity: EntityType) {
        let handle = self
            .lock_session()
            .ok()
            .and_then(|mut s| s.as_mut().and_then(|s| s.watches.remove(&entity)));
        drop(handle);
    }

    /// Whether `entity` has a live change subscription
    pub fn is_watching(&self, entity: EntityType) -> bool {
        self.lock_session()
            .map(|s| {
                s.as_ref()
                    .and_then(|s| s.watches.get(&entity))
                    .is_some_and(SubscriptionHandle::is_active)
            })
            .unwrap_or(false)
    }

    /// Replace the category reference data used for display joins
    pub fn set_categories(&self, categories: Vec<Category>) {
        if let Ok(mut current) = self.categories.write() {
            *current = categories;
        }
    }

    /// Keys whose cached list changed
    pub fn changes(&self) -> broadcast::Receiver<CollectionKey> {
        self.cache.changes()
    }

    /// Count encrypted vs total stored records per entity type
    pub async fn coverage(&self) -> LedgerResult<EncryptionCoverage> {
        let user_id = self.user_id()?;
        let mut coverage = EncryptionCoverage::default();
        for entity in EntityType::ALL {
            let rows: Vec<Record> = self
                .store
                .select(entity.table(), &user_id)
                .await?
                .into_iter()
                .filter(|r| !is_soft_deleted(r))
                .collect();
            coverage.set(entity, CoverageCount::count(&rows, entity));
        }
        Ok(coverage)
    }

    fn key(&self, entity: EntityType) -> LedgerResult<CollectionKey> {
        Ok(CollectionKey::new(entity, self.user_id()?))
    }

    fn context(&self) -> SyncContext {
        SyncContext {
            store: Arc::clone(&self.store),
            codec: self.codec.clone(),
            cache: self.cache.clone(),
            categories: Arc::clone(&self.categories),
            temp_id_prefix: self.settings.temp_id_prefix.clone(),
        }
    }

    fn lock_session(&self) -> LedgerResult<std::sync::MutexGuard<'_, Option<Session>>> {
        self.session
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Failed to acquire session lock: {}", e)))
    }
}
