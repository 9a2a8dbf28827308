//! In-memory durable store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use prepsync_common::{Result, SharedClock, SystemClock};

use crate::collection::{Collection, IndexQuery, PersistedEntity};
use crate::store::DurableStore;

/// In-memory store.
///
/// Useful for testing and ephemeral sessions. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    collections: Arc<RwLock<HashMap<Collection, HashMap<String, PersistedEntity>>>>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store stamping records with `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        let mut collections = HashMap::new();
        for collection in Collection::ALL {
            collections.insert(collection, HashMap::new());
        }
        Self {
            collections: Arc::new(RwLock::new(collections)),
            clock,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<Collection, HashMap<String, PersistedEntity>>) -> T) -> T {
        let guard = self.collections.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut HashMap<Collection, HashMap<String, PersistedEntity>>) -> T,
    ) -> T {
        let mut guard = self.collections.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, collection: Collection, mut entity: PersistedEntity) -> Result<PersistedEntity> {
        entity.last_updated = self.clock.now();
        let stored = entity.clone();
        self.write(|c| {
            c.entry(collection)
                .or_default()
                .insert(entity.id.clone(), entity)
        });
        Ok(stored)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<PersistedEntity>> {
        Ok(self.read(|c| c.get(&collection).and_then(|items| items.get(id).cloned())))
    }

    async fn query_by_index(
        &self,
        collection: Collection,
        query: &IndexQuery,
    ) -> Result<Vec<PersistedEntity>> {
        let mut results: Vec<PersistedEntity> = self.read(|c| {
            c.get(&collection)
                .map(|items| items.values().filter(|e| query.matches(e)).cloned().collect())
                .unwrap_or_default()
        });
        results.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        Ok(self.write(|c| {
            c.get_mut(&collection)
                .map(|items| items.remove(id).is_some())
                .unwrap_or(false)
        }))
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.write(|c| {
            if let Some(items) = c.get_mut(&collection) {
                items.clear();
            }
        });
        Ok(())
    }

    async fn count(&self, collection: Collection) -> Result<u64> {
        Ok(self.read(|c| c.get(&collection).map(|items| items.len()).unwrap_or(0)) as u64)
    }

    async fn purge_before(&self, collection: Collection, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self.write(|c| {
            let Some(items) = c.get_mut(&collection) else {
                return 0;
            };
            let before = items.len();
            items.retain(|_, e| e.last_updated >= cutoff);
            (before - items.len()) as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepsync_common::{Clock, ManualClock};
    use serde_json::json;

    fn entity(id: &str, owner: &str) -> PersistedEntity {
        PersistedEntity::new(id, json!({ "id": id }))
            .unwrap()
            .with_owner(owner)
    }

    #[tokio::test]
    async fn test_put_stamps_last_updated() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));

        let stored = store.put(Collection::Attempts, entity("a1", "u1")).await.unwrap();
        assert_eq!(stored.last_updated, clock.now());

        let fetched = store.get(Collection::Attempts, "a1").await.unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = MemoryStore::new();
        store.put(Collection::Attempts, entity("x", "u1")).await.unwrap();

        assert!(store.get(Collection::Results, "x").await.unwrap().is_none());
        assert_eq!(store.count(Collection::Attempts).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));

        store.put(Collection::Attempts, entity("old", "u1")).await.unwrap();
        clock.advance_ms(10);
        store.put(Collection::Attempts, entity("new", "u1")).await.unwrap();
        store.put(Collection::Attempts, entity("other", "u2")).await.unwrap();

        let ids: Vec<String> = store
            .query_by_index(Collection::Attempts, &IndexQuery::Owner("u1".into()))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));

        store.put(Collection::Results, entity("r1", "u1")).await.unwrap();
        clock.advance_ms(1000);
        let cutoff = clock.now();
        store.put(Collection::Results, entity("r2", "u1")).await.unwrap();

        assert_eq!(store.purge_before(Collection::Results, cutoff).await.unwrap(), 1);
        assert!(store.delete(Collection::Results, "r2").await.unwrap());
        assert!(!store.delete(Collection::Results, "r2").await.unwrap());
        assert_eq!(store.count(Collection::Results).await.unwrap(), 0);
    }
}
