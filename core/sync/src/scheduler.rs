//! Debounce scheduling for bursty writes.
//!
//! A burst of saves for the same key collapses into one emission carrying
//! the latest value, fired once the key has been quiet for the configured
//! window. `flush` hands over everything pending immediately so lifecycle
//! hooks can push snapshots out before the process goes away.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

struct Pending<V> {
    value: V,
    deadline: Instant,
    first_scheduled: Instant,
}

struct DebounceInner<K, V> {
    quiet: Duration,
    max_wait: Option<Duration>,
    pending: Mutex<HashMap<K, Pending<V>>>,
    wake: Notify,
}

/// Keyed debouncer keeping only the latest value per key.
pub struct Debouncer<K, V> {
    inner: Arc<DebounceInner<K, V>>,
}

impl<K, V> Clone for Debouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Create a debouncer firing after `quiet` without new values.
    pub fn new(quiet: Duration) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                quiet,
                max_wait: None,
                pending: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Cap how long a continuously rescheduled key can be held back.
    pub fn with_max_wait(quiet: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                quiet,
                max_wait,
                pending: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Quiet window.
    pub fn quiet(&self) -> Duration {
        self.inner.quiet
    }

    /// Replace the pending value for `key` and push its deadline out.
    pub fn schedule(&self, key: K, value: V) {
        let now = Instant::now();
        {
            let mut pending = self.lock();
            let first_scheduled = pending
                .get(&key)
                .map(|p| p.first_scheduled)
                .unwrap_or(now);

            let mut deadline = now + self.inner.quiet;
            if let Some(max_wait) = self.inner.max_wait {
                deadline = deadline.min(first_scheduled + max_wait);
            }

            pending.insert(
                key,
                Pending {
                    value,
                    deadline,
                    first_scheduled,
                },
            );
        }
        self.inner.wake.notify_one();
    }

    /// Drop the pending value for `key`.
    pub fn cancel(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|p| p.value)
    }

    /// Whether `key` has a pending value.
    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of pending keys.
    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|p| p.deadline).min()
    }

    /// Remove and return every entry whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&self, now: Instant) -> Vec<(K, V)> {
        let mut pending = self.lock();
        let due: Vec<K> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut taken: Vec<(K, Pending<V>)> = due
            .into_iter()
            .filter_map(|k| pending.remove(&k).map(|p| (k, p)))
            .collect();
        taken.sort_by_key(|(_, p)| p.deadline);
        taken.into_iter().map(|(k, p)| (k, p.value)).collect()
    }

    /// Remove and return every pending entry now, earliest deadline first.
    pub fn flush(&self) -> Vec<(K, V)> {
        let mut taken: Vec<(K, Pending<V>)> = self.lock().drain().collect();
        taken.sort_by_key(|(_, p)| p.deadline);
        taken.into_iter().map(|(k, p)| (k, p.value)).collect()
    }

    /// Run the timer loop, handing due entries to `sink` until shutdown.
    ///
    /// This should be spawned in a tokio task. Entries still pending at
    /// shutdown stay pending; call [`flush`](Self::flush) to collect them.
    pub async fn run<F>(&self, mut sink: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(K, V) + Send,
    {
        info!("Debounce scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.next_deadline();
            tokio::select! {
                _ = wait_until(next) => {
                    let due = self.take_due(Instant::now());
                    if !due.is_empty() {
                        debug!("Debounce window elapsed for {} key(s)", due.len());
                    }
                    for (key, value) in due {
                        sink(key, value);
                    }
                }
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Debounce scheduler shutting down");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Pending<V>>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        // Nothing pending; a new schedule wakes the loop.
        None => std::future::pending::<()>().await,
    }
}
