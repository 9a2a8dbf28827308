//! Sync task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Domain of a queued mutation; selects the remote adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Progress,
    Result,
    Profile,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Progress => "progress",
            TaskKind::Result => "result",
            TaskKind::Profile => "profile",
        })
    }
}

/// Task priority; higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(5);
    /// Used by forced flushes (completion, page hide, pause).
    pub const CRITICAL: Priority = Priority(u8::MAX);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Per-task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    /// Terminal: applied remotely and removed.
    Synced,
    /// Failed an attempt, requeued.
    RetryPending,
    /// Terminal: retries exhausted and removed.
    Failed,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Synced | TaskState::Failed)
    }
}

/// One queued mutation awaiting application to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: String,
    pub kind: TaskKind,
    /// Entity the payload describes, when known (e.g. the attempt id).
    pub entity_id: Option<String>,
    /// Snapshot of the entity at enqueue time.
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub last_error: Option<String>,
    /// Every error seen, oldest first.
    pub errors: Vec<String>,
    pub state: TaskState,
}

impl SyncTask {
    /// Create a queued task.
    pub fn new(kind: TaskKind, payload: serde_json::Value, options: &EnqueueOptions, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            entity_id: options.entity_id.clone(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(max_retries).max(1),
            priority: options.priority,
            last_error: None,
            errors: Vec::new(),
            state: TaskState::Queued,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.retry_count += 1;
        self.errors.push(error.clone());
        self.last_error = Some(error);
    }

    /// Whether every allowed attempt has been spent.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Options for [`SyncQueue::enqueue`](crate::queue::SyncQueue::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Overrides the queue-wide attempt limit.
    pub max_retries: Option<u32>,
    pub entity_id: Option<String>,
}

impl EnqueueOptions {
    /// Options with the given priority.
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Set the attempt limit for this task.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Tag the task with the entity it describes.
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}
