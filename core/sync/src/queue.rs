//! Priority sync queue with a single-flight drain loop.
//!
//! Tasks are kept stable-sorted by priority, highest first. Exactly one
//! drain loop runs at a time; the guard is an async mutex taken with
//! `try_lock`, so a concurrent caller returns immediately and its task is
//! picked up by the loop that is already running.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use prepsync_common::{Error, Result};

use crate::adapter::AdapterRegistry;
use crate::event::SyncEvent;
use crate::retry::BackoffPolicy;
use crate::task::{EnqueueOptions, SyncTask, TaskKind, TaskState};

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per task unless overridden at enqueue time.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Safety-net periodic drain while the worker runs (None = triggers only).
    pub poll_interval_ms: Option<u64>,
    /// Buffered events per subscriber before lagging.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            poll_interval_ms: Some(30_000),
            event_capacity: 256,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    /// The pass stopped because connectivity was lost.
    pub halted_offline: bool,
}

/// Snapshot for "pending sync" indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: bool,
    pub online: bool,
    pub running: bool,
}

struct Inner {
    config: QueueConfig,
    adapters: AdapterRegistry,
    tasks: Mutex<VecDeque<SyncTask>>,
    drain_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Ordered queue of pending remote mutations.
///
/// Cloning is cheap and every clone shares the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Inner>,
}

impl SyncQueue {
    /// Create a queue dispatching to `adapters`. The queue starts online.
    pub fn new(config: QueueConfig, adapters: AdapterRegistry) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                adapters,
                tasks: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                processing: AtomicBool::new(false),
                online: AtomicBool::new(true),
                events,
                wake: Notify::new(),
                worker: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Add a task and return its id.
    ///
    /// The task is placed after every task of equal or higher priority.
    /// When online, a running worker is woken to drain immediately. Without
    /// a worker the task waits for the next [`drain`](Self::drain) call.
    ///
    /// # Errors
    /// - `InvalidInput` if no adapter is registered for `kind`
    pub fn enqueue(&self, kind: TaskKind, payload: serde_json::Value, options: EnqueueOptions) -> Result<String> {
        if !self.inner.adapters.has_adapter(kind) {
            return Err(Error::InvalidInput(format!(
                "no adapter registered for '{}' tasks",
                kind
            )));
        }

        let task = SyncTask::new(kind, payload, &options, self.inner.config.max_retries);
        let id = task.id.clone();
        debug!(
            "Enqueued {} task {} (priority {})",
            task.kind, task.id, task.priority.0
        );
        insert_by_priority(&mut self.lock_tasks(), task.clone());
        self.emit(SyncEvent::Added(task));

        if self.is_online() && self.is_running() {
            self.inner.wake.notify_one();
        }
        Ok(id)
    }

    /// Process queued tasks until the queue is empty or connectivity is lost.
    ///
    /// A concurrent [`stop`](Self::stop) ends the drain after the in-flight
    /// task. Returns `None` without doing anything if another drain is in
    /// progress.
    pub async fn drain(&self) -> Option<DrainReport> {
        let guard = self.inner.drain_lock.try_lock().ok()?;
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let mut report = DrainReport::default();
        let mut dequeued = false;

        loop {
            if *shutdown_rx.borrow() {
                debug!("Drain interrupted by shutdown");
                break;
            }
            if !self.is_online() {
                report.halted_offline = true;
                debug!("Drain halted: offline");
                break;
            }

            let Some(mut task) = self.lock_tasks().pop_front() else {
                break;
            };
            dequeued = true;
            self.inner.processing.store(true, Ordering::SeqCst);
            task.state = TaskState::Processing;
            self.emit(SyncEvent::Processing(task.clone()));

            let outcome = match self.inner.adapters.resolve(task.kind) {
                Ok(adapter) => adapter.apply(&task).await,
                Err(e) => Err(e),
            };
            self.inner.processing.store(false, Ordering::SeqCst);

            match outcome {
                Ok(()) => {
                    task.state = TaskState::Synced;
                    report.synced += 1;
                    debug!("Synced {} task {}", task.kind, task.id);
                    self.emit(SyncEvent::Synced(task));
                }
                Err(e) => {
                    let error = e.to_string();
                    task.record_failure(error.clone());

                    if e.is_contract_violation() || task.is_exhausted() {
                        task.state = TaskState::Failed;
                        report.failed += 1;
                        warn!(
                            "Dropping {} task {} after {} attempt(s): {}",
                            task.kind, task.id, task.retry_count, error
                        );
                        self.emit(SyncEvent::Failed { task, error });
                    } else {
                        task.state = TaskState::RetryPending;
                        report.retried += 1;
                        let delay = self.inner.config.backoff.delay_for_retry(task.retry_count);
                        debug!(
                            "Retrying {} task {} in {:?} ({}/{}): {}",
                            task.kind, task.id, delay, task.retry_count, task.max_retries, error
                        );
                        insert_by_priority(&mut self.lock_tasks(), task.clone());
                        self.emit(SyncEvent::Retry { task, error, delay });

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                }
            }
        }

        let empty = self.lock_tasks().is_empty();
        if dequeued && empty {
            self.emit(SyncEvent::Idle);
        }
        drop(guard);

        // A task enqueued between the last empty check and the unlock would
        // otherwise wait for the next trigger.
        if !empty && self.is_online() && !*shutdown_rx.borrow() {
            self.inner.wake.notify_one();
        }

        Some(report)
    }

    /// Update connectivity. Going online triggers a drain.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }

        if online {
            info!("Sync queue online");
            self.emit(SyncEvent::Online);
            self.inner.wake.notify_one();
        } else {
            info!("Sync queue offline");
            self.emit(SyncEvent::Offline);
        }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Spawn the background worker. No-op if already running.
    ///
    /// The worker drains on enqueue, on the online transition and on the
    /// configured poll interval.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }

        self.inner.shutdown.send_replace(false);
        let shutdown_rx = self.inner.shutdown.subscribe();
        let poll = self.inner.config.poll_interval_ms.map(Duration::from_millis);
        let queue = self.clone();
        *worker = Some(tokio::spawn(async move {
            queue.run_worker(shutdown_rx, poll).await;
        }));

        // Pick up anything queued before the worker existed.
        self.inner.wake.notify_one();
    }

    /// Stop the worker. An in-flight task is allowed to finish.
    ///
    /// Tasks stay queued and can still be pushed with [`drain`](Self::drain).
    pub async fn stop(&self) {
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.inner.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            warn!("Sync queue worker ended abnormally: {}", e);
        }
        self.inner.shutdown.send_replace(false);
        info!("Sync queue stopped");
    }

    /// Whether the background worker is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Drop every queued task. Returns the number dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut tasks = self.lock_tasks();
            let n = tasks.len();
            tasks.clear();
            n
        };
        info!("Cleared {} queued task(s)", dropped);
        self.emit(SyncEvent::Cleared { dropped });
        dropped
    }

    /// Queue status.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending_count(),
            processing: self.inner.processing.load(Ordering::SeqCst),
            online: self.is_online(),
            running: self.is_running(),
        }
    }

    /// Number of queued tasks, excluding the one in flight.
    pub fn pending_count(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Snapshot of queued tasks in drain order.
    pub fn tasks(&self) -> Vec<SyncTask> {
        self.lock_tasks().iter().cloned().collect()
    }

    async fn run_worker(&self, mut shutdown_rx: watch::Receiver<bool>, poll: Option<Duration>) {
        let mut ticker = poll.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!("Sync queue worker started");

        loop {
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = wait_for_tick(&mut ticker) => {
                    debug!("Periodic drain");
                }
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }
            if !self.is_online() {
                continue;
            }

            if let Some(report) = self.drain().await {
                if report != DrainReport::default() {
                    debug!(
                        "Drain finished: {} synced, {} retried, {} failed",
                        report.synced, report.retried, report.failed
                    );
                }
            }
        }

        info!("Sync queue worker shutting down");
    }

    fn lock_tasks(&self) -> MutexGuard<'_, VecDeque<SyncTask>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Insert after the last task whose priority is greater than or equal.
fn insert_by_priority(tasks: &mut VecDeque<SyncTask>, task: SyncTask) {
    let position = tasks
        .iter()
        .rposition(|queued| queued.priority >= task.priority)
        .map(|i| i + 1)
        .unwrap_or(0);
    tasks.insert(position, task);
}

async fn wait_for_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::adapter_fn;
    use crate::task::Priority;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_retries: 3,
            backoff: BackoffPolicy::flat(Duration::from_millis(1)),
            poll_interval_ms: None,
            event_capacity: 64,
        }
    }

    fn recording_queue() -> (SyncQueue, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let adapter = adapter_fn(move |task: SyncTask| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(task.payload);
                Ok(())
            }
        });
        let registry = AdapterRegistry::new().with(TaskKind::Progress, adapter);
        (SyncQueue::new(fast_config(), registry), seen)
    }

    fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_priority_fairness() {
        let (queue, seen) = recording_queue();
        for (n, priority) in [(1, Priority::NORMAL), (2, Priority::HIGH), (3, Priority::NORMAL)] {
            queue
                .enqueue(TaskKind::Progress, serde_json::json!(n), EnqueueOptions::new(priority))
                .unwrap();
        }

        let report = queue.drain().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(2), serde_json::json!(1), serde_json::json!(3)]);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (queue, _) = recording_queue();
        let err = queue
            .enqueue(TaskKind::Result, serde_json::Value::Null, EnqueueOptions::default())
            .unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let adapter = adapter_fn(move |_task: SyncTask| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("timeout".into()))
            }
        });
        let queue = SyncQueue::new(fast_config(), AdapterRegistry::new().with(TaskKind::Progress, adapter));
        let mut rx = queue.subscribe();

        queue
            .enqueue(TaskKind::Progress, serde_json::Value::Null, EnqueueOptions::default())
            .unwrap();
        let report = queue.drain().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(report.retried, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.pending_count(), 0);

        let names = drain_events(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "failed").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "retry").count(), 2);
        assert_eq!(names.last(), Some(&"idle"));
    }

    #[tokio::test]
    async fn test_contract_violation_fails_fast() {
        let adapter = adapter_fn(|_task: SyncTask| async { Err(Error::InvalidInput("bad payload".into())) });
        let queue = SyncQueue::new(fast_config(), AdapterRegistry::new().with(TaskKind::Progress, adapter));

        queue
            .enqueue(TaskKind::Progress, serde_json::Value::Null, EnqueueOptions::default())
            .unwrap();
        let report = queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn test_offline_halts_drain() {
        let (queue, seen) = recording_queue();
        let mut rx = queue.subscribe();
        queue.set_online(false);
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(1), EnqueueOptions::default())
            .unwrap();

        let report = queue.drain().await.unwrap();
        assert!(report.halted_offline);
        assert_eq!(queue.pending_count(), 1);
        assert!(seen.lock().unwrap().is_empty());

        queue.set_online(true);
        queue.set_online(true);
        let report = queue.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(drain_events(&mut rx), vec!["offline", "added", "online", "processing", "synced", "idle"]);
    }

    #[tokio::test]
    async fn test_single_flight_drain() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let adapter = adapter_fn(move |_task: SyncTask| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        });
        let queue = SyncQueue::new(fast_config(), AdapterRegistry::new().with(TaskKind::Progress, adapter));
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(1), EnqueueOptions::default())
            .unwrap();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.status().processing);

        // Concurrent drain is a no-op; the running loop picks up the new task.
        assert!(queue.drain().await.is_none());
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(2), EnqueueOptions::default())
            .unwrap();

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(5)).await;
        release.notify_one();

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.synced, 2);
    }

    #[tokio::test]
    async fn test_clear_emits_event() {
        let (queue, _) = recording_queue();
        let mut rx = queue.subscribe();
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(1), EnqueueOptions::default())
            .unwrap();

        assert_eq!(queue.clear(), 1);
        assert_eq!(drain_events(&mut rx), vec!["added", "cleared"]);
        assert!(queue.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_worker_drains_on_enqueue() {
        let (queue, seen) = recording_queue();
        let mut rx = queue.subscribe();
        queue.start();
        assert!(queue.status().running);

        queue
            .enqueue(TaskKind::Progress, serde_json::json!(7), EnqueueOptions::default())
            .unwrap();

        let synced = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SyncEvent::Synced(task)) = rx.recv().await {
                    return task;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(synced.payload, serde_json::json!(7));
        assert_eq!(seen.lock().unwrap().len(), 1);

        queue.stop().await;
        assert!(!queue.status().running);
    }

    #[tokio::test]
    async fn test_enqueue_without_worker_waits_for_drain() {
        let (queue, seen) = recording_queue();
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(1), EnqueueOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending_count(), 1);
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(queue.drain().await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_drain_after_stop() {
        let (queue, seen) = recording_queue();
        queue.stop().await;
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(1), EnqueueOptions::default())
            .unwrap();
        let report = queue.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(queue.pending_count(), 0);

        queue.start();
        queue.stop().await;
        queue
            .enqueue(TaskKind::Progress, serde_json::json!(2), EnqueueOptions::default())
            .unwrap();
        let report = queue.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(1), serde_json::json!(2)]);
    }
}
