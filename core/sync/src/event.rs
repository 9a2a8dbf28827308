//! Sync queue event stream.

use std::time::Duration;

use crate::task::SyncTask;

/// Event emitted by the sync queue.
///
/// This stream is the public boundary consumed by status displays.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Task accepted into the queue.
    Added(SyncTask),
    /// Task dequeued and dispatched to its adapter.
    Processing(SyncTask),
    /// Task applied remotely and removed.
    Synced(SyncTask),
    /// Attempt failed; task requeued and the loop pauses for `delay`.
    Retry {
        task: SyncTask,
        error: String,
        delay: Duration,
    },
    /// Attempts exhausted; task dropped.
    Failed { task: SyncTask, error: String },
    /// Queue drained empty.
    Idle,
    Online,
    Offline,
    /// Queue emptied by `clear`.
    Cleared { dropped: usize },
}

impl SyncEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Added(_) => "added",
            SyncEvent::Processing(_) => "processing",
            SyncEvent::Synced(_) => "synced",
            SyncEvent::Retry { .. } => "retry",
            SyncEvent::Failed { .. } => "failed",
            SyncEvent::Idle => "idle",
            SyncEvent::Online => "online",
            SyncEvent::Offline => "offline",
            SyncEvent::Cleared { .. } => "cleared",
        }
    }

    /// Task carried by the event, if any.
    pub fn task(&self) -> Option<&SyncTask> {
        match self {
            SyncEvent::Added(task)
            | SyncEvent::Processing(task)
            | SyncEvent::Synced(task)
            | SyncEvent::Retry { task, .. }
            | SyncEvent::Failed { task, .. } => Some(task),
            _ => None,
        }
    }
}
