//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use prepsync_common::{Error, Result, SharedClock};
use prepsync_storage::{
    open_or_disabled, CacheConfig, DurableStore, EphemeralCache, MemoryBackend, MemoryStore,
};

use crate::adapter::{AdapterRegistry, RemoteFetchAdapter};
use crate::orchestrator::{OrchestratorConfig, ProgressOrchestrator};
use crate::queue::{QueueConfig, SyncQueue};

/// Complete configuration for one sync engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub orchestrator: OrchestratorConfig,
    /// SQLite file for the durable store (None = in-memory store).
    pub database_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Open the configured durable store, degrading to a disabled store if
    /// the database cannot be opened.
    pub fn open_store(&self, clock: SharedClock) -> Arc<dyn DurableStore> {
        match &self.database_path {
            Some(path) => open_or_disabled(path, clock),
            None => Arc::new(MemoryStore::with_clock(clock)),
        }
    }

    /// Wire cache, store, queue and orchestrator together.
    pub fn assemble(
        &self,
        adapters: AdapterRegistry,
        remote: Option<Arc<dyn RemoteFetchAdapter>>,
        clock: SharedClock,
    ) -> ProgressOrchestrator {
        let backend = match self.cache.quota_bytes {
            Some(quota) => MemoryBackend::with_quota(quota),
            None => MemoryBackend::new(),
        };
        let cache = EphemeralCache::with_clock(Arc::new(backend), self.cache.clone(), clock.clone());
        let store = self.open_store(clock.clone());
        info!("Assembling sync engine with {} store", store.name());

        let queue = SyncQueue::new(self.queue.clone(), adapters);
        let mut builder = ProgressOrchestrator::builder(queue)
            .with_cache(Arc::new(cache))
            .with_store(store)
            .with_clock(clock)
            .with_config(self.orchestrator.clone());
        if let Some(remote) = remote {
            builder = builder.with_remote(remote);
        }
        builder.build()
    }
}
