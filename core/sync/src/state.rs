//! Per-entity sync state tracking, driven by queue events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use prepsync_common::Result;

use crate::event::SyncEvent;
use crate::task::TaskKind;

/// Sync status for a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes not yet applied remotely.
    Pending,
    /// A task for the entity is in flight.
    Syncing,
    /// Every queued change has been applied.
    Synced,
    /// The last task was dropped without being applied.
    Failed,
}

/// Sync metadata for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub entity_id: String,
    pub kind: TaskKind,
    pub status: SyncStatus,
    /// Tasks for this entity still in the queue.
    pub queued: u32,
    /// Last local change.
    pub last_change: DateTime<Utc>,
    /// Last successful remote apply.
    pub last_synced: Option<DateTime<Utc>>,
    /// Failed attempts since the last success.
    pub failure_count: u32,
    pub last_error: Option<String>,
}

impl SyncEntry {
    /// Create an entry for a locally changed entity.
    pub fn new_pending(entity_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            status: SyncStatus::Pending,
            queued: 0,
            last_change: Utc::now(),
            last_synced: None,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Mark a new local change.
    pub fn mark_pending(&mut self) {
        self.last_change = Utc::now();
        if self.status != SyncStatus::Syncing {
            self.status = SyncStatus::Pending;
        }
    }

    /// Mark as in flight.
    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
    }

    /// Mark one task as applied.
    pub fn mark_synced(&mut self) {
        self.queued = self.queued.saturating_sub(1);
        self.last_synced = Some(Utc::now());
        self.failure_count = 0;
        self.last_error = None;
        self.status = if self.queued == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
    }

    /// Record a failed attempt that will be retried.
    pub fn mark_retry(&mut self, error: impl Into<String>) {
        self.failure_count += 1;
        self.last_error = Some(error.into());
        self.status = SyncStatus::Pending;
    }

    /// Mark one task as dropped.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.queued = self.queued.saturating_sub(1);
        self.failure_count += 1;
        self.last_error = Some(error.into());
        self.status = SyncStatus::Failed;
    }
}

/// Sync state across every tracked entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    entries: HashMap<String, SyncEntry>,
    /// When the queue last drained empty.
    pub last_idle: Option<DateTime<Utc>>,
    /// Whether a task is currently in flight.
    pub sync_in_progress: bool,
    pub online: bool,
}

impl SyncState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self {
            online: true,
            ..Self::default()
        }
    }

    /// Fold a queue event into the state.
    pub fn apply(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::Added(task) => {
                if let Some(id) = &task.entity_id {
                    let entry = self
                        .entries
                        .entry(id.clone())
                        .or_insert_with(|| SyncEntry::new_pending(id.clone(), task.kind));
                    entry.queued += 1;
                    entry.mark_pending();
                }
            }
            SyncEvent::Processing(task) => {
                self.sync_in_progress = true;
                if let Some(entry) = self.entry_for(task.entity_id.as_deref()) {
                    entry.mark_syncing();
                }
            }
            SyncEvent::Synced(task) => {
                self.sync_in_progress = false;
                if let Some(entry) = self.entry_for(task.entity_id.as_deref()) {
                    entry.mark_synced();
                }
            }
            SyncEvent::Retry { task, error, .. } => {
                self.sync_in_progress = false;
                if let Some(entry) = self.entry_for(task.entity_id.as_deref()) {
                    entry.mark_retry(error.clone());
                }
            }
            SyncEvent::Failed { task, error } => {
                self.sync_in_progress = false;
                if let Some(entry) = self.entry_for(task.entity_id.as_deref()) {
                    entry.mark_failed(error.clone());
                }
            }
            SyncEvent::Idle => {
                self.sync_in_progress = false;
                self.last_idle = Some(Utc::now());
            }
            SyncEvent::Online => self.online = true,
            SyncEvent::Offline => self.online = false,
            SyncEvent::Cleared { .. } => {
                for entry in self.entries.values_mut().filter(|e| e.queued > 0) {
                    entry.queued = 0;
                    entry.status = SyncStatus::Failed;
                    entry.last_error = Some("queue cleared".to_string());
                }
            }
        }
    }

    /// Record a local change not yet handed to the queue.
    pub fn mark_pending(&mut self, entity_id: &str, kind: TaskKind) {
        self.entries
            .entry(entity_id.to_string())
            .or_insert_with(|| SyncEntry::new_pending(entity_id, kind))
            .mark_pending();
    }

    /// Get the entry for an entity.
    pub fn get(&self, entity_id: &str) -> Option<&SyncEntry> {
        self.entries.get(entity_id)
    }

    /// Stop tracking an entity.
    pub fn remove(&mut self, entity_id: &str) -> Option<SyncEntry> {
        self.entries.remove(entity_id)
    }

    /// All entries.
    pub fn entries(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.values()
    }

    /// Entries with a specific status.
    pub fn entries_with_status(&self, status: SyncStatus) -> Vec<&SyncEntry> {
        self.entries.values().filter(|e| e.status == status).collect()
    }

    /// Count entries by status.
    pub fn count_by_status(&self) -> HashMap<SyncStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Whether any entity has unsynced changes.
    pub fn has_pending_changes(&self) -> bool {
        self.entries
            .values()
            .any(|e| matches!(e.status, SyncStatus::Pending | SyncStatus::Syncing))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn entry_for(&mut self, entity_id: Option<&str>) -> Option<&mut SyncEntry> {
        entity_id.and_then(|id| self.entries.get_mut(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EnqueueOptions, SyncTask};
    use std::time::Duration;

    fn task(entity: &str) -> SyncTask {
        SyncTask::new(
            TaskKind::Progress,
            serde_json::Value::Null,
            &EnqueueOptions::default().with_entity(entity),
            3,
        )
    }

    #[test]
    fn test_event_lifecycle() {
        let mut state = SyncState::new();
        let t = task("a1");

        state.apply(&SyncEvent::Added(t.clone()));
        assert_eq!(state.get("a1").unwrap().status, SyncStatus::Pending);
        assert!(state.has_pending_changes());

        state.apply(&SyncEvent::Processing(t.clone()));
        assert_eq!(state.get("a1").unwrap().status, SyncStatus::Syncing);
        assert!(state.sync_in_progress);

        state.apply(&SyncEvent::Synced(t));
        let entry = state.get("a1").unwrap();
        assert_eq!(entry.status, SyncStatus::Synced);
        assert!(entry.last_synced.is_some());
        assert!(!state.has_pending_changes());
    }

    #[test]
    fn test_older_task_success_keeps_newer_pending() {
        let mut state = SyncState::new();
        let first = task("a1");
        let second = task("a1");

        state.apply(&SyncEvent::Added(first.clone()));
        state.apply(&SyncEvent::Added(second));
        state.apply(&SyncEvent::Synced(first));

        assert_eq!(state.get("a1").unwrap().status, SyncStatus::Pending);
    }

    #[test]
    fn test_retry_then_failure() {
        let mut state = SyncState::new();
        let t = task("a1");
        state.apply(&SyncEvent::Added(t.clone()));
        state.apply(&SyncEvent::Retry {
            task: t.clone(),
            error: "timeout".into(),
            delay: Duration::from_millis(1),
        });
        assert_eq!(state.get("a1").unwrap().failure_count, 1);

        state.apply(&SyncEvent::Failed {
            task: t,
            error: "timeout".into(),
        });
        let entry = state.get("a1").unwrap();
        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.failure_count, 2);
        assert_eq!(state.count_by_status().get(&SyncStatus::Failed), Some(&1));
    }

    #[test]
    fn test_connectivity_and_clear() {
        let mut state = SyncState::new();
        state.apply(&SyncEvent::Added(task("a1")));
        state.apply(&SyncEvent::Offline);
        assert!(!state.online);

        state.apply(&SyncEvent::Cleared { dropped: 1 });
        assert_eq!(state.entries_with_status(SyncStatus::Failed).len(), 1);
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::new();
        state.mark_pending("a1", TaskKind::Progress);

        let json = state.to_json().unwrap();
        let restored = SyncState::from_json(&json).unwrap();
        assert_eq!(restored.entries().count(), 1);
    }
}
