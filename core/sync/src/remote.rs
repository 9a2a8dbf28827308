//! In-memory remote store for testing and simulation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use prepsync_common::{AttemptId, Error, OwnerId, ProgressRecord, Result};

use crate::adapter::{AdapterRegistry, RemoteFetchAdapter, RemoteSyncAdapter};
use crate::task::{SyncTask, TaskKind};

type ProgressKey = (String, String);

/// Authoritative store kept in memory.
///
/// Implements both adapter traits. Writes are last-write-wins by
/// `updated_at`, so replaying an older or identical snapshot is harmless.
/// Failures can be injected to exercise retry paths.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    progress: Arc<RwLock<HashMap<ProgressKey, ProgressRecord>>>,
    documents: Arc<RwLock<HashMap<(TaskKind, String), serde_json::Value>>>,
    deliveries: Arc<RwLock<Vec<SyncTask>>>,
    unreachable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU32>,
}

impl MemoryRemote {
    /// Create an empty, reachable remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry routing every task kind to this remote.
    pub fn registry(&self) -> AdapterRegistry {
        let adapter: Arc<dyn RemoteSyncAdapter> = Arc::new(self.clone());
        AdapterRegistry::new()
            .with(TaskKind::Progress, adapter.clone())
            .with(TaskKind::Result, adapter.clone())
            .with(TaskKind::Profile, adapter)
    }

    /// Make every call fail with a network error until reset.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a network error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis().min(u32::MAX as u128) as u32, Ordering::SeqCst);
    }

    /// Seed or overwrite a progress record, as another device would.
    pub fn put_progress(&self, record: ProgressRecord) {
        let key = progress_key(&record.owner_id, &record.attempt_id);
        self.progress
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record);
    }

    /// Current remote copy of an attempt.
    pub fn progress(&self, owner_id: &OwnerId, attempt_id: &AttemptId) -> Option<ProgressRecord> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&progress_key(owner_id, attempt_id))
            .cloned()
    }

    /// Stored result/profile document.
    pub fn document(&self, kind: TaskKind, entity_id: &str) -> Option<serde_json::Value> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, entity_id.to_string()))
            .cloned()
    }

    /// Every task successfully applied, in delivery order.
    pub fn deliveries(&self) -> Vec<SyncTask> {
        self.deliveries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network("remote unreachable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(())
    }

    fn apply_progress(&self, record: ProgressRecord) {
        let key = progress_key(&record.owner_id, &record.attempt_id);
        let mut progress = self.progress.write().unwrap_or_else(|e| e.into_inner());
        match progress.get(&key) {
            Some(existing) if existing.updated_at > record.updated_at => {
                debug!("Ignoring stale snapshot for attempt {}", record.attempt_id);
            }
            _ => {
                progress.insert(key, record);
            }
        }
    }
}

#[async_trait]
impl RemoteSyncAdapter for MemoryRemote {
    async fn apply(&self, task: &SyncTask) -> Result<()> {
        self.gate().await?;

        match task.kind {
            TaskKind::Progress => {
                let record: ProgressRecord = serde_json::from_value(task.payload.clone())
                    .map_err(|e| Error::InvalidInput(format!("malformed progress payload: {}", e)))?;
                self.apply_progress(record);
            }
            TaskKind::Result | TaskKind::Profile => {
                let entity_id = task.entity_id.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("{} task {} has no entity id", task.kind, task.id))
                })?;
                self.documents
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert((task.kind, entity_id), task.payload.clone());
            }
        }

        self.deliveries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        Ok(())
    }
}

#[async_trait]
impl RemoteFetchAdapter for MemoryRemote {
    async fn fetch_progress(
        &self,
        attempt_id: &AttemptId,
        owner_id: &OwnerId,
    ) -> Result<Option<ProgressRecord>> {
        self.gate().await?;
        Ok(self.progress(owner_id, attempt_id))
    }

    async fn fetch_all_progress(&self, owner_id: &OwnerId) -> Result<Vec<ProgressRecord>> {
        self.gate().await?;
        let progress = self.progress.read().unwrap_or_else(|e| e.into_inner());
        Ok(progress
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

fn progress_key(owner_id: &OwnerId, attempt_id: &AttemptId) -> ProgressKey {
    (owner_id.as_str().to_string(), attempt_id.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EnqueueOptions;
    use chrono::{Duration as ChronoDuration, Utc};

    fn record(updated_offset: i64) -> ProgressRecord {
        let now = Utc::now();
        let mut rec = ProgressRecord::new(
            AttemptId::new("a1").unwrap(),
            OwnerId::new("u1").unwrap(),
            "exam",
            now,
        );
        rec.updated_at = now + ChronoDuration::seconds(updated_offset);
        rec
    }

    fn task(rec: &ProgressRecord) -> SyncTask {
        SyncTask::new(
            TaskKind::Progress,
            serde_json::to_value(rec).unwrap(),
            &EnqueueOptions::default(),
            3,
        )
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_overwrite() {
        let remote = MemoryRemote::new();
        let newer = record(10);
        let mut older = newer.clone();
        older.updated_at = newer.updated_at - ChronoDuration::seconds(5);
        older.current_index = 99;

        remote.apply(&task(&newer)).await.unwrap();
        remote.apply(&task(&older)).await.unwrap();

        let stored = remote.progress(&newer.owner_id, &newer.attempt_id).unwrap();
        assert_eq!(stored, newer);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next(1);
        let rec = record(0);

        assert!(matches!(remote.apply(&task(&rec)).await, Err(Error::Network(_))));
        remote.apply(&task(&rec)).await.unwrap();
        assert_eq!(remote.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_fetch() {
        let remote = MemoryRemote::new();
        remote.set_reachable(false);
        let owner = OwnerId::new("u1").unwrap();
        assert!(remote.fetch_all_progress(&owner).await.is_err());
    }

    #[tokio::test]
    async fn test_result_requires_entity_id() {
        let remote = MemoryRemote::new();
        let task = SyncTask::new(TaskKind::Result, serde_json::json!({}), &EnqueueOptions::default(), 3);
        let err = remote.apply(&task).await.unwrap_err();
        assert!(err.is_contract_violation());
    }
}
