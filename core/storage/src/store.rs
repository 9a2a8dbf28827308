//! Durable structured store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use prepsync_common::{Error, Result, SharedClock};

use crate::collection::{Collection, IndexQuery, PersistedEntity};
use crate::sqlite::SqliteStore;

/// Indexed, per-record transactional store for bulky entities.
///
/// The store is an accelerator: callers treat every error as "not stored
/// locally" and fall back to the remote store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store engine name (e.g. "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert or replace `entity` by id, stamping `last_updated`.
    ///
    /// # Postconditions
    /// - Returns the entity as stored, with its new `last_updated`
    async fn put(&self, collection: Collection, entity: PersistedEntity) -> Result<PersistedEntity>;

    /// Get an entity by id.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<PersistedEntity>>;

    /// Query a secondary index. Results are ordered by `last_updated`, newest first.
    async fn query_by_index(
        &self,
        collection: Collection,
        query: &IndexQuery,
    ) -> Result<Vec<PersistedEntity>>;

    /// Delete an entity. Returns whether it existed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    /// Remove every entity in a collection.
    async fn clear(&self, collection: Collection) -> Result<()>;

    /// Number of entities in a collection.
    async fn count(&self, collection: Collection) -> Result<u64>;

    /// Delete entities last updated before `cutoff`. Returns the count removed.
    async fn purge_before(&self, collection: Collection, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Store used when the durable engine could not be opened.
///
/// Every call fails with [`Error::StorageUnavailable`] so callers take their
/// remote fallback path.
#[derive(Debug, Clone)]
pub struct DisabledStore {
    reason: String,
}

impl DisabledStore {
    /// Create a disabled store remembering why the real one is missing.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(Error::StorageUnavailable(self.reason.clone()))
    }
}

#[async_trait]
impl DurableStore for DisabledStore {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn put(&self, _collection: Collection, _entity: PersistedEntity) -> Result<PersistedEntity> {
        self.unavailable()
    }

    async fn get(&self, _collection: Collection, _id: &str) -> Result<Option<PersistedEntity>> {
        self.unavailable()
    }

    async fn query_by_index(
        &self,
        _collection: Collection,
        _query: &IndexQuery,
    ) -> Result<Vec<PersistedEntity>> {
        self.unavailable()
    }

    async fn delete(&self, _collection: Collection, _id: &str) -> Result<bool> {
        self.unavailable()
    }

    async fn clear(&self, _collection: Collection) -> Result<()> {
        self.unavailable()
    }

    async fn count(&self, _collection: Collection) -> Result<u64> {
        self.unavailable()
    }

    async fn purge_before(&self, _collection: Collection, _cutoff: DateTime<Utc>) -> Result<u64> {
        self.unavailable()
    }
}

/// Open the SQLite store at `path`, degrading to a [`DisabledStore`] on failure.
pub fn open_or_disabled(path: impl AsRef<Path>, clock: SharedClock) -> Arc<dyn DurableStore> {
    let path = path.as_ref();
    match SqliteStore::open(path, clock) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "Durable store at {} unavailable, continuing without it: {}",
                path.display(),
                e
            );
            Arc::new(DisabledStore::new(e.to_string()))
        }
    }
}
