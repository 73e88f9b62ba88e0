//! Optimistic sync engine
//!
//! Writes are applied to the local cache first, sealed and sent to the
//! remote store, then reconciled by a single refresh once they settle.
//! Change feeds from the store invalidate the cache so edits made by other
//! sessions show up without polling.

pub mod cache;
pub mod mutation;
pub mod subscriber;

pub use cache::{
    CollectionFetcher, CollectionKey, PendingMutation, QueryCache, RefreshTicket, RemoteFetcher,
};
pub use mutation::{MutationCoordinator, MutationKind, MutationRecord, MutationState, Snapshot};
pub use subscriber::{
    invalidate_on_change, ChangeHandlers, ChangeSubscriber, Subscription, SubscriptionHandle,
};

use std::sync::{Arc, RwLock};

use crate::crypto::EntityCodec;
use crate::models::Category;
use crate::storage::RemoteStore;

/// Everything a coordinator needs, shared across a session
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn RemoteStore>,
    pub codec: EntityCodec,
    pub cache: QueryCache,
    /// Reference data for denormalizing provisional records
    pub categories: Arc<RwLock<Vec<Category>>>,
    pub temp_id_prefix: String,
}
