//! Connectivity and application lifecycle signals.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::queue::SyncQueue;

/// Host application lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    VisibilityHidden,
    VisibilityVisible,
    PageHide,
    BeforeUnload,
    Paused,
    Resumed,
}

impl LifecycleEvent {
    /// Whether pending snapshots must be pushed out immediately.
    pub fn requires_flush(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::VisibilityHidden
                | LifecycleEvent::PageHide
                | LifecycleEvent::BeforeUnload
                | LifecycleEvent::Paused
        )
    }
}

/// Connectivity flag set by the embedding application.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report connectivity. Only changes are forwarded to subscribers.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Forward every change into `queue`. The task ends when the monitor is
    /// dropped.
    pub fn attach(&self, queue: SyncQueue) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        queue.set_online(*rx.borrow_and_update());

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                debug!("Connectivity changed: online={}", online);
                queue.set_online(online);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
