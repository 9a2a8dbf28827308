//! Remote adapter traits and the per-kind adapter registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use prepsync_common::{AttemptId, Error, OwnerId, ProgressRecord, Result};

use crate::task::{SyncTask, TaskKind};

/// Applies one kind of queued mutation to the authoritative remote store.
///
/// Implementations must be idempotent keyed by (owner, entity id): replaying
/// a task that was already applied succeeds without side effects.
#[async_trait]
pub trait RemoteSyncAdapter: Send + Sync {
    /// Apply `task` remotely.
    ///
    /// # Errors
    /// - Transient failures (`Network`, `Remote`) are retried by the queue
    /// - Contract violations (`InvalidInput`) fail the task immediately
    async fn apply(&self, task: &SyncTask) -> Result<()>;
}

/// Reads authoritative progress state.
#[async_trait]
pub trait RemoteFetchAdapter: Send + Sync {
    /// Fetch one attempt. `Ok(None)` means the remote has never seen it.
    async fn fetch_progress(
        &self,
        attempt_id: &AttemptId,
        owner_id: &OwnerId,
    ) -> Result<Option<ProgressRecord>>;

    /// Fetch every attempt owned by `owner_id`.
    async fn fetch_all_progress(&self, owner_id: &OwnerId) -> Result<Vec<ProgressRecord>>;
}

/// Adapter built from an async closure.
pub struct FnAdapter<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RemoteSyncAdapter for FnAdapter<F>
where
    F: Fn(SyncTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn apply(&self, task: &SyncTask) -> Result<()> {
        (self.f)(task.clone()).await
    }
}

/// Wrap an async closure as a [`RemoteSyncAdapter`].
pub fn adapter_fn<F, Fut>(f: F) -> Arc<dyn RemoteSyncAdapter>
where
    F: Fn(SyncTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnAdapter { f })
}

/// Registry mapping task kinds to their remote adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<TaskKind, Arc<dyn RemoteSyncAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the adapter for `kind`.
    ///
    /// # Errors
    /// - `InvalidInput` if `kind` already has an adapter
    pub fn register(&mut self, kind: TaskKind, adapter: Arc<dyn RemoteSyncAdapter>) -> Result<()> {
        if self.adapters.contains_key(&kind) {
            return Err(Error::InvalidInput(format!(
                "adapter for '{}' tasks is already registered",
                kind
            )));
        }
        self.adapters.insert(kind, adapter);
        Ok(())
    }

    /// Builder-style registration. Replaces an existing adapter for `kind`.
    pub fn with(mut self, kind: TaskKind, adapter: Arc<dyn RemoteSyncAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    /// Resolve the adapter for `kind`.
    pub fn resolve(&self, kind: TaskKind) -> Result<Arc<dyn RemoteSyncAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no adapter registered for '{}' tasks", kind)))
    }

    /// Whether `kind` has an adapter.
    pub fn has_adapter(&self, kind: TaskKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<TaskKind> {
        self.adapters.keys().copied().collect()
    }
}
