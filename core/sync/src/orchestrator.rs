//! Progress orchestrator.
//!
//! Coordinates the ephemeral cache, the durable store, the remote fetch
//! adapter and the sync queue for exam attempt progress. Reads fall through
//! cache, store and remote in that order. Writes land locally right away and
//! reach the network through a debounced, queued path.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use prepsync_common::{
    AttemptId, Error, OwnerId, ProgressRecord, Result, SharedClock, SystemClock,
};
use prepsync_storage::{
    CacheConfig, Collection, DurableStore, EphemeralCache, IndexQuery, MemoryBackend, MemoryStore,
    PersistedEntity,
};

use crate::adapter::RemoteFetchAdapter;
use crate::conflict::{ConflictDecision, ConflictResolver, ConflictStrategy};
use crate::monitor::LifecycleEvent;
use crate::queue::SyncQueue;
use crate::scheduler::Debouncer;
use crate::state::{SyncState, SyncStatus};
use crate::task::{EnqueueOptions, Priority, TaskKind};

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lifetime of cached progress snapshots.
    pub progress_ttl_ms: u64,
    /// Quiet window before a saved snapshot is queued.
    pub debounce_ms: u64,
    /// Upper bound on how long continuous saves can hold a snapshot back.
    pub debounce_max_wait_ms: Option<u64>,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            progress_ttl_ms: 24 * 60 * 60 * 1000,
            debounce_ms: 2_000,
            debounce_max_wait_ms: Some(30_000),
            conflict_strategy: ConflictStrategy::LastWriteWins,
        }
    }
}

type ProgressKey = (OwnerId, AttemptId);

struct Inner {
    cache: Arc<EphemeralCache>,
    store: Arc<dyn DurableStore>,
    queue: SyncQueue,
    remote: Option<Arc<dyn RemoteFetchAdapter>>,
    resolver: ConflictResolver,
    debouncer: Debouncer<ProgressKey, ProgressRecord>,
    state: Arc<RwLock<SyncState>>,
    /// Serializes writes to the local layers.
    write_lock: AsyncMutex<()>,
    clock: SharedClock,
    config: OrchestratorConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Entry point for reading and writing attempt progress.
///
/// Cloning is cheap and every clone shares the same layers.
#[derive(Clone)]
pub struct ProgressOrchestrator {
    inner: Arc<Inner>,
}

/// Builder for [`ProgressOrchestrator`].
pub struct OrchestratorBuilder {
    queue: SyncQueue,
    cache: Option<Arc<EphemeralCache>>,
    store: Option<Arc<dyn DurableStore>>,
    remote: Option<Arc<dyn RemoteFetchAdapter>>,
    clock: SharedClock,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Use `cache` instead of a fresh in-memory cache.
    pub fn with_cache(mut self, cache: Arc<EphemeralCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use `store` instead of an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Read authoritative state through `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteFetchAdapter>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Clock used for completion stamps and the default layers.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator. Workers are not started.
    pub fn build(self) -> ProgressOrchestrator {
        let clock = self.clock;
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(EphemeralCache::with_clock(
                Arc::new(MemoryBackend::new()),
                CacheConfig::default(),
                clock.clone(),
            ))
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(clock.clone())));
        let debouncer = Debouncer::with_max_wait(
            Duration::from_millis(self.config.debounce_ms),
            self.config.debounce_max_wait_ms.map(Duration::from_millis),
        );
        let (shutdown, _) = watch::channel(false);

        ProgressOrchestrator {
            inner: Arc::new(Inner {
                cache,
                store,
                queue: self.queue,
                remote: self.remote,
                resolver: ConflictResolver::new(self.config.conflict_strategy),
                debouncer,
                state: Arc::new(RwLock::new(SyncState::new())),
                write_lock: AsyncMutex::new(()),
                clock,
                config: self.config,
                workers: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }
}

impl ProgressOrchestrator {
    /// Start building an orchestrator around `queue`.
    pub fn builder(queue: SyncQueue) -> OrchestratorBuilder {
        OrchestratorBuilder {
            queue,
            cache: None,
            store: None,
            remote: None,
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
        }
    }

    /// The queue carrying this orchestrator's tasks.
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// The durable store.
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.inner.store
    }

    /// Load an attempt, falling through cache, durable store and remote.
    ///
    /// Lower-layer hits back-fill the layers above. A cache hit schedules a
    /// background reconcile against the remote. Remote failures yield `None`.
    pub async fn load_progress(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> Option<ProgressRecord> {
        if let Some(record) = self.cache_get(attempt_id, owner_id) {
            debug!("Cache hit for attempt {}", attempt_id);
            self.spawn_reconcile(attempt_id.clone(), owner_id.clone());
            return Some(record);
        }

        if let Some(record) = self.store_get(attempt_id, owner_id).await {
            debug!("Durable store hit for attempt {}", attempt_id);
            self.cache_set(&record);
            return Some(record);
        }

        let remote = self.inner.remote.as_ref()?;
        match remote.fetch_progress(attempt_id, owner_id).await {
            Ok(Some(record)) => {
                debug!("Remote hit for attempt {}", attempt_id);
                self.repair_local(record).await.map(|d| d.data)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Remote fetch for attempt {} failed: {}", attempt_id, e);
                None
            }
        }
    }

    /// Compare the local snapshot with the remote one and repair the loser.
    ///
    /// When the remote copy wins it replaces the cached and stored copies.
    /// When the local copy is strictly newer, or the remote has never seen
    /// the attempt, a normal-priority task is queued unless one is already
    /// waiting. Returns `Ok(None)` when neither side exists or no remote is
    /// configured.
    pub async fn reconcile(
        &self,
        attempt_id: &AttemptId,
        owner_id: &OwnerId,
    ) -> Result<Option<ConflictDecision<ProgressRecord>>> {
        let Some(remote) = self.inner.remote.as_ref() else {
            return Ok(None);
        };

        let local = self.read_local(attempt_id, owner_id).await;
        let remote_record = remote.fetch_progress(attempt_id, owner_id).await?;
        let decision = self
            .inner
            .resolver
            .resolve(local.clone(), remote_record.clone());

        let decision = match decision {
            Some(d) if d.is_remote() && local.as_ref() != Some(&d.data) => {
                self.repair_local(d.data).await
            }
            other => other,
        };

        if let Some(d) = decision.as_ref().filter(|d| !d.is_remote()) {
            let key = (owner_id.clone(), attempt_id.clone());
            let remote_behind = remote_record
                .as_ref()
                .map_or(true, |r| d.data.updated_at > r.updated_at);
            if remote_behind && !self.inner.debouncer.is_pending(&key) && !self.has_queued(attempt_id) {
                info!("Remote copy of attempt {} is behind, queueing local snapshot", attempt_id);
                enqueue_progress(&self.inner.queue, &d.data, Priority::NORMAL)?;
            }
        }

        Ok(decision)
    }

    /// Save a snapshot locally and schedule a debounced sync.
    ///
    /// # Errors
    /// - `InvalidInput` if the attempt or owner id is blank
    /// - `NotPermitted` if a different snapshot of a completed attempt exists
    pub async fn save_progress(&self, record: ProgressRecord) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        self.check_writable(&record).await?;
        self.write_local(&record).await;

        self.inner
            .state
            .write()
            .await
            .mark_pending(record.attempt_id.as_str(), TaskKind::Progress);
        self.inner
            .debouncer
            .schedule((record.owner_id.clone(), record.attempt_id.clone()), record);
        Ok(())
    }

    /// Save locally and queue immediately at critical priority.
    ///
    /// Any debounced snapshot for the attempt is dropped. Returns the task id.
    ///
    /// # Errors
    /// Same as [`save_progress`](Self::save_progress), plus `InvalidInput`
    /// if no progress adapter is registered.
    pub async fn force_sync(&self, record: ProgressRecord) -> Result<String> {
        let _guard = self.inner.write_lock.lock().await;
        self.check_writable(&record).await?;
        self.write_local(&record).await;

        let key = (record.owner_id.clone(), record.attempt_id.clone());
        if self.inner.debouncer.cancel(&key).is_some() {
            debug!("Superseded debounced snapshot for attempt {}", record.attempt_id);
        }
        enqueue_progress(&self.inner.queue, &record, Priority::CRITICAL)
    }

    /// Finalize an attempt and force it out.
    pub async fn complete_progress(&self, mut record: ProgressRecord) -> Result<ProgressRecord> {
        if !record.is_completed() {
            record.complete(self.inner.clock.now())?;
        }
        self.force_sync(record.clone()).await?;
        info!("Attempt {} completed", record.attempt_id);
        Ok(record)
    }

    /// Store an attempt result and queue it at high priority.
    pub async fn save_result(
        &self,
        owner_id: &OwnerId,
        result_id: &str,
        payload: serde_json::Value,
    ) -> Result<String> {
        let entity = PersistedEntity::new(result_id, payload.clone())?.with_owner(owner_id.as_str());
        if let Err(e) = self.inner.store.put(Collection::Results, entity).await {
            warn!("Failed to store result {} locally: {}", result_id, e);
        }

        self.inner.queue.enqueue(
            TaskKind::Result,
            payload,
            EnqueueOptions::new(Priority::HIGH).with_entity(result_id),
        )
    }

    /// Remove an attempt from the local layers.
    ///
    /// Drops any debounced snapshot. Tasks already queued still run.
    /// Returns whether anything was removed.
    pub async fn delete_progress(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> bool {
        let key = (owner_id.clone(), attempt_id.clone());
        let mut removed = self.inner.debouncer.cancel(&key).is_some();
        removed |= self.inner.cache.remove(&cache_key(owner_id, attempt_id));

        match self.inner.store.delete(Collection::Attempts, attempt_id.as_str()).await {
            Ok(existed) => removed |= existed,
            Err(e) => warn!("Failed to delete attempt {} locally: {}", attempt_id, e),
        }

        self.inner.state.write().await.remove(attempt_id.as_str());
        debug!("Deleted attempt {} (found: {})", attempt_id, removed);
        removed
    }

    /// Every attempt owned by `owner_id`, local and remote merged.
    ///
    /// Remote winners repair the local layers. When the remote is
    /// unreachable the local view is returned. Newest first.
    pub async fn get_all_progress(&self, owner_id: &OwnerId) -> Vec<ProgressRecord> {
        let local = match self
            .inner
            .store
            .query_by_index(Collection::Attempts, &IndexQuery::Owner(owner_id.as_str().to_string()))
            .await
        {
            Ok(entities) => entities
                .iter()
                .filter_map(|entity| match entity.to_progress() {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("Skipping undecodable attempt {}: {}", entity.id, e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Local attempt query failed: {}", e);
                Vec::new()
            }
        };

        let mut merged = match &self.inner.remote {
            None => local,
            Some(remote) => match remote.fetch_all_progress(owner_id).await {
                Ok(remote_records) => {
                    let decisions = self.inner.resolver.merge_decisions(local, remote_records);
                    let mut records = Vec::with_capacity(decisions.len());
                    for decision in decisions {
                        let data = if decision.is_remote() {
                            match self.repair_local(decision.data.clone()).await {
                                Some(current) => current.data,
                                None => decision.data,
                            }
                        } else {
                            decision.data
                        };
                        records.push(data);
                    }
                    records
                }
                Err(e) => {
                    warn!("Remote listing failed, using local attempts: {}", e);
                    local
                }
            },
        };

        merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        merged
    }

    /// Move every debounced snapshot into the queue at critical priority.
    ///
    /// Synchronous so it can run from lifecycle hooks. Returns the number of
    /// snapshots queued.
    pub fn flush_pending(&self) -> usize {
        let pending = self.inner.debouncer.flush();
        let mut queued = 0;
        for (_, record) in pending {
            match enqueue_progress(&self.inner.queue, &record, Priority::CRITICAL) {
                Ok(_) => queued += 1,
                Err(e) => warn!("Failed to flush attempt {}: {}", record.attempt_id, e),
            }
        }
        if queued > 0 {
            info!("Flushed {} pending snapshot(s)", queued);
        }
        queued
    }

    /// React to a host lifecycle transition.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) -> usize {
        if event.requires_flush() {
            debug!("Lifecycle {:?}: flushing pending snapshots", event);
            self.flush_pending()
        } else {
            0
        }
    }

    /// Start the queue worker, the debounce timer and state tracking.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }

        self.inner.shutdown.send_replace(false);
        self.inner.queue.start();

        let debouncer = self.inner.debouncer.clone();
        let queue = self.inner.queue.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            debouncer
                .run(
                    move |_key, record: ProgressRecord| {
                        if let Err(e) = enqueue_progress(&queue, &record, Priority::NORMAL) {
                            warn!("Failed to queue attempt {}: {}", record.attempt_id, e);
                        }
                    },
                    shutdown_rx,
                )
                .await;
        }));

        let mut events = self.inner.queue.subscribe();
        let state = self.inner.state.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => state.write().await.apply(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Sync state tracker lagged, {} event(s) skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        info!("Progress orchestrator started");
    }

    /// Flush pending snapshots into the queue, then stop every worker.
    pub async fn stop(&self) {
        self.flush_pending();
        self.inner.queue.stop().await;
        self.inner.shutdown.send_replace(true);

        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!("Orchestrator worker ended abnormally: {}", e);
            }
        }
        info!("Progress orchestrator stopped");
    }

    /// Sync status of one attempt, if tracked.
    pub async fn sync_status(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> Option<SyncStatus> {
        if self
            .inner
            .debouncer
            .is_pending(&(owner_id.clone(), attempt_id.clone()))
        {
            return Some(SyncStatus::Pending);
        }
        self.inner
            .state
            .read()
            .await
            .get(attempt_id.as_str())
            .map(|entry| entry.status)
    }

    /// Snapshot of the tracked sync state.
    pub async fn state(&self) -> SyncState {
        self.inner.state.read().await.clone()
    }

    /// Changes not yet applied remotely: debounced snapshots plus queued tasks.
    pub fn pending_sync_count(&self) -> usize {
        self.inner.debouncer.pending_len() + self.inner.queue.pending_count()
    }

    async fn check_writable(&self, record: &ProgressRecord) -> Result<()> {
        if record.attempt_id.as_str().trim().is_empty() || record.owner_id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput(
                "progress record needs an attempt id and an owner id".to_string(),
            ));
        }

        if let Some(existing) = self.read_local(&record.attempt_id, &record.owner_id).await {
            if existing.is_completed() && existing != *record {
                return Err(Error::NotPermitted(format!(
                    "attempt {} is completed and cannot be overwritten",
                    record.attempt_id
                )));
            }
        }
        Ok(())
    }

    fn spawn_reconcile(&self, attempt_id: AttemptId, owner_id: OwnerId) {
        if self.inner.remote.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reconcile(&attempt_id, &owner_id).await {
                debug!("Background reconcile of attempt {} failed: {}", attempt_id, e);
            }
        });
    }

    fn has_queued(&self, attempt_id: &AttemptId) -> bool {
        self.inner.queue.tasks().iter().any(|task| {
            task.kind == TaskKind::Progress && task.entity_id.as_deref() == Some(attempt_id.as_str())
        })
    }

    async fn read_local(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> Option<ProgressRecord> {
        match self.cache_get(attempt_id, owner_id) {
            Some(record) => Some(record),
            None => self.store_get(attempt_id, owner_id).await,
        }
    }

    fn cache_get(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> Option<ProgressRecord> {
        self.inner.cache.get(&cache_key(owner_id, attempt_id))
    }

    fn cache_set(&self, record: &ProgressRecord) -> bool {
        let ttl = Duration::from_millis(self.inner.config.progress_ttl_ms);
        self.inner
            .cache
            .set(&cache_key(&record.owner_id, &record.attempt_id), record, ttl)
    }

    async fn store_get(&self, attempt_id: &AttemptId, owner_id: &OwnerId) -> Option<ProgressRecord> {
        let entity = match self.inner.store.get(Collection::Attempts, attempt_id.as_str()).await {
            Ok(entity) => entity?,
            Err(e) => {
                debug!("Durable store read for attempt {} failed: {}", attempt_id, e);
                return None;
            }
        };

        if entity.owner_id.as_deref() != Some(owner_id.as_str()) {
            return None;
        }
        match entity.to_progress() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Stored attempt {} is undecodable: {}", attempt_id, e);
                None
            }
        }
    }

    /// Adopt a remote copy unless it lost to the local copy in the meantime.
    ///
    /// The local copy is re-read under the write lock, so a save that landed
    /// while the remote fetch was in flight is resolved against instead of
    /// overwritten. Returns the decision against that current copy.
    async fn repair_local(&self, candidate: ProgressRecord) -> Option<ConflictDecision<ProgressRecord>> {
        let _guard = self.inner.write_lock.lock().await;
        let current = self.read_local(&candidate.attempt_id, &candidate.owner_id).await;
        let unchanged = current.as_ref() == Some(&candidate);
        let decision = self.inner.resolver.resolve(current, Some(candidate))?;

        if decision.is_remote() && !unchanged {
            info!("Remote copy of attempt {} is newer, repairing local layers", decision.data.attempt_id);
            self.inner
                .debouncer
                .cancel(&(decision.data.owner_id.clone(), decision.data.attempt_id.clone()));
            self.write_local(&decision.data).await;
        } else if !decision.is_remote() {
            debug!("Local copy of attempt {} changed during fetch, keeping it", decision.data.attempt_id);
        }
        Some(decision)
    }

    /// Write to cache and durable store. Failures are logged, never returned.
    async fn write_local(&self, record: &ProgressRecord) {
        if !self.cache_set(record) {
            debug!("Attempt {} not cached", record.attempt_id);
        }

        let result = match PersistedEntity::from_progress(record) {
            Ok(entity) => self.inner.store.put(Collection::Attempts, entity).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to store attempt {} locally: {}", record.attempt_id, e);
        }
    }
}

fn cache_key(owner_id: &OwnerId, attempt_id: &AttemptId) -> String {
    format!("progress:{}:{}", owner_id, attempt_id)
}

fn enqueue_progress(queue: &SyncQueue, record: &ProgressRecord, priority: Priority) -> Result<String> {
    let payload = serde_json::to_value(record)?;
    queue.enqueue(
        TaskKind::Progress,
        payload,
        EnqueueOptions::new(priority).with_entity(record.attempt_id.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::remote::MemoryRemote;
    use crate::retry::BackoffPolicy;
    use chrono::{Duration as ChronoDuration, Utc};
    use prepsync_storage::DisabledStore;

    fn ids() -> (AttemptId, OwnerId) {
        (AttemptId::new("attempt-1").unwrap(), OwnerId::new("user-1").unwrap())
    }

    fn setup() -> (ProgressOrchestrator, MemoryRemote) {
        let remote = MemoryRemote::new();
        let queue = SyncQueue::new(
            QueueConfig {
                backoff: BackoffPolicy::flat(Duration::from_millis(1)),
                poll_interval_ms: None,
                ..QueueConfig::default()
            },
            remote.registry(),
        );
        let orchestrator = ProgressOrchestrator::builder(queue)
            .with_remote(Arc::new(remote.clone()))
            .with_config(OrchestratorConfig {
                debounce_ms: 20,
                ..OrchestratorConfig::default()
            })
            .build();
        (orchestrator, remote)
    }

    fn record() -> ProgressRecord {
        let (attempt, owner) = ids();
        ProgressRecord::new(attempt, owner, "exam-1", Utc::now())
    }

    #[tokio::test]
    async fn test_save_then_load_is_local() {
        let (orchestrator, remote) = setup();
        let mut rec = record();
        rec.answer(0, [2], Utc::now()).unwrap();
        orchestrator.save_progress(rec.clone()).await.unwrap();

        remote.set_reachable(false);
        let (attempt, owner) = ids();
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(rec));
        assert_eq!(orchestrator.pending_sync_count(), 1);
    }

    #[tokio::test]
    async fn test_blank_ids_rejected() {
        let (orchestrator, _) = setup();
        let rec: ProgressRecord = serde_json::from_value(serde_json::json!({
            "attemptId": " ",
            "ownerId": "user-1",
            "examId": "exam-1",
            "currentIndex": 0,
            "status": "not_started",
            "startedAt": Utc::now(),
            "updatedAt": Utc::now(),
        }))
        .unwrap();

        let err = orchestrator.save_progress(rec).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_completed_record_is_immutable() {
        let (orchestrator, _) = setup();
        let completed = orchestrator.complete_progress(record()).await.unwrap();
        assert!(completed.is_completed());

        let mut rewrite = record();
        rewrite.current_index = 5;
        let err = orchestrator.save_progress(rewrite).await.unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));

        // Re-saving the identical snapshot is allowed.
        orchestrator.save_progress(completed).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_sync_supersedes_debounce() {
        let (orchestrator, _) = setup();
        orchestrator.save_progress(record()).await.unwrap();

        let mut newer = record();
        newer.navigate(3, Utc::now() + ChronoDuration::seconds(1)).unwrap();
        orchestrator.force_sync(newer.clone()).await.unwrap();

        let tasks = orchestrator.queue().tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, Priority::CRITICAL);
        assert_eq!(orchestrator.flush_pending(), 0);
    }

    #[tokio::test]
    async fn test_remote_fallback_and_backfill() {
        let (orchestrator, remote) = setup();
        let rec = record();
        remote.put_progress(rec.clone());

        let (attempt, owner) = ids();
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(rec.clone()));

        remote.set_reachable(false);
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(rec));
    }

    #[tokio::test]
    async fn test_load_with_remote_failure_returns_none() {
        let (orchestrator, remote) = setup();
        remote.set_reachable(false);
        let (attempt, owner) = ids();
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, None);
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_a_miss() {
        let (orchestrator, _) = setup();
        orchestrator.save_progress(record()).await.unwrap();

        let (attempt, _) = ids();
        let stranger = OwnerId::new("user-2").unwrap();
        assert_eq!(orchestrator.load_progress(&attempt, &stranger).await, None);
    }

    #[tokio::test]
    async fn test_reconcile_remote_wins() {
        let (orchestrator, remote) = setup();
        let local = record();
        orchestrator.save_progress(local.clone()).await.unwrap();

        let mut newer = local.clone();
        newer.navigate(9, local.updated_at + ChronoDuration::seconds(30)).unwrap();
        remote.put_progress(newer.clone());

        let (attempt, owner) = ids();
        let decision = orchestrator.reconcile(&attempt, &owner).await.unwrap().unwrap();
        assert!(decision.is_remote());
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(newer));
    }

    #[tokio::test]
    async fn test_save_during_reconcile_fetch_is_kept() {
        let (orchestrator, remote) = setup();
        let base = Utc::now();
        let mut first = record();
        first.updated_at = base;
        orchestrator.save_progress(first.clone()).await.unwrap();

        let mut remote_copy = first.clone();
        remote_copy.navigate(4, base + ChronoDuration::seconds(10)).unwrap();
        remote.put_progress(remote_copy);
        remote.set_latency(Duration::from_millis(50));

        // Cache hit: reconcile starts fetching in the background.
        let (attempt, owner) = ids();
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(first.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut latest = first;
        latest.answer(7, [2], base + ChronoDuration::seconds(20)).unwrap();
        orchestrator.save_progress(latest.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        remote.set_reachable(false);
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(latest));
        assert_eq!(orchestrator.pending_sync_count(), 1);
    }

    #[tokio::test]
    async fn test_save_during_listing_fetch_is_kept() {
        let (orchestrator, remote) = setup();
        let base = Utc::now();
        let mut first = record();
        first.updated_at = base;
        orchestrator.save_progress(first.clone()).await.unwrap();

        let mut remote_copy = first.clone();
        remote_copy.navigate(4, base + ChronoDuration::seconds(10)).unwrap();
        remote.put_progress(remote_copy);
        remote.set_latency(Duration::from_millis(50));

        let (attempt, owner) = ids();
        let listing = {
            let orchestrator = orchestrator.clone();
            let owner = owner.clone();
            tokio::spawn(async move { orchestrator.get_all_progress(&owner).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut latest = first;
        latest.answer(7, [2], base + ChronoDuration::seconds(20)).unwrap();
        orchestrator.save_progress(latest.clone()).await.unwrap();

        assert_eq!(listing.await.unwrap(), vec![latest.clone()]);
        remote.set_reachable(false);
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(latest));
        assert_eq!(orchestrator.pending_sync_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_queues_when_remote_missing() {
        let (attempt, owner) = ids();
        let store = Arc::new(MemoryStore::new());
        store
            .put(Collection::Attempts, PersistedEntity::from_progress(&record()).unwrap())
            .await
            .unwrap();

        let remote = MemoryRemote::new();
        let queue = SyncQueue::new(QueueConfig::default(), remote.registry());
        let orchestrator = ProgressOrchestrator::builder(queue)
            .with_store(store)
            .with_remote(Arc::new(remote))
            .build();

        let decision = orchestrator.reconcile(&attempt, &owner).await.unwrap().unwrap();
        assert!(!decision.is_remote());
        assert_eq!(orchestrator.queue().pending_count(), 1);

        // A second reconcile does not queue a duplicate.
        orchestrator.reconcile(&attempt, &owner).await.unwrap();
        assert_eq!(orchestrator.queue().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_store_degrades_to_cache() {
        let remote = MemoryRemote::new();
        let queue = SyncQueue::new(QueueConfig::default(), remote.registry());
        let orchestrator = ProgressOrchestrator::builder(queue)
            .with_store(Arc::new(DisabledStore::new("test")))
            .build();

        let rec = record();
        orchestrator.save_progress(rec.clone()).await.unwrap();
        let (attempt, owner) = ids();
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, Some(rec));
    }

    #[tokio::test]
    async fn test_delete_progress() {
        let (orchestrator, _) = setup();
        orchestrator.save_progress(record()).await.unwrap();

        let (attempt, owner) = ids();
        assert!(orchestrator.delete_progress(&attempt, &owner).await);
        assert_eq!(orchestrator.pending_sync_count(), 0);
        assert_eq!(orchestrator.load_progress(&attempt, &owner).await, None);
    }

    #[tokio::test]
    async fn test_lifecycle_flush() {
        let (orchestrator, _) = setup();
        orchestrator.save_progress(record()).await.unwrap();

        assert_eq!(orchestrator.handle_lifecycle(LifecycleEvent::VisibilityVisible), 0);
        assert_eq!(orchestrator.handle_lifecycle(LifecycleEvent::PageHide), 1);
        assert_eq!(orchestrator.queue().tasks()[0].priority, Priority::CRITICAL);
    }

    #[tokio::test]
    async fn test_save_result_is_high_priority() {
        let (orchestrator, remote) = setup();
        let (_, owner) = ids();
        orchestrator
            .save_result(&owner, "result-1", serde_json::json!({"score": 42}))
            .await
            .unwrap();

        let tasks = orchestrator.queue().tasks();
        assert_eq!(tasks[0].priority, Priority::HIGH);
        orchestrator.queue().drain().await.unwrap();
        assert_eq!(
            remote.document(TaskKind::Result, "result-1"),
            Some(serde_json::json!({"score": 42}))
        );
    }
}
