//! TTL-based ephemeral cache.
//!
//! Entries expire lazily: an expired or outdated entry is removed the next
//! time it is read, there is no sweeping task. Every operation is infallible
//! from the caller's point of view; backend failures turn the cache into a
//! no-op that reports `false` / `None`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use prepsync_common::{SharedClock, SystemClock};

use crate::backend::CacheBackend;

/// Configuration for the ephemeral cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix applied to every key; `clear` only touches prefixed keys.
    pub namespace: String,
    /// Entries written under another schema version are treated as expired.
    pub schema_version: u32,
    /// Byte quota for the in-memory backend (None = unbounded).
    pub quota_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "prepsync:".to_string(),
            schema_version: 1,
            quota_bytes: Some(5 * 1024 * 1024),
        }
    }
}

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub schema_version: u32,
}

impl CacheEntry {
    /// Milliseconds since the entry was written (never negative).
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.written_at).num_milliseconds().max(0) as u64
    }

    /// Valid iff `now - written_at <= ttl` and the schema version matches.
    pub fn is_valid(&self, now: DateTime<Utc>, schema_version: u32) -> bool {
        self.schema_version == schema_version && self.age_ms(now) <= self.ttl_ms
    }
}

/// Fast synchronous cache for small, frequently-read data.
pub struct EphemeralCache {
    backend: Option<Arc<dyn CacheBackend>>,
    clock: SharedClock,
    config: CacheConfig,
}

impl EphemeralCache {
    /// Create a cache over `backend` using the system clock.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Create a cache with an explicit clock.
    pub fn with_clock(
        backend: Arc<dyn CacheBackend>,
        config: CacheConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            backend: Some(backend),
            clock,
            config,
        }
    }

    /// A cache with no backend: every write returns `false`, every read `None`.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            clock: Arc::new(SystemClock),
            config: CacheConfig::default(),
        }
    }

    /// Whether a backend is attached.
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Store `data` under `key` for `ttl`.
    ///
    /// Returns `false` if the value could not be serialized or stored.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };

        let payload = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Cache set {} skipped, unserializable value: {}", key, e);
                return false;
            }
        };

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            written_at: self.clock.now(),
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
            schema_version: self.config.schema_version,
        };
        self.write_entry(backend.as_ref(), &entry)
    }

    /// Get the value under `key` if present, unexpired and decodable.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.valid_entry(key)?;
        match serde_json::from_value(entry.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Cache entry {} has unexpected shape: {}", key, e);
                self.remove(key);
                None
            }
        }
    }

    /// Whether a valid entry exists. Evicts the entry if it has expired.
    pub fn has(&self, key: &str) -> bool {
        self.valid_entry(key).is_some()
    }

    /// Age of a valid entry.
    pub fn get_age(&self, key: &str) -> Option<Duration> {
        let entry = self.valid_entry(key)?;
        Some(Duration::from_millis(entry.age_ms(self.clock.now())))
    }

    /// Re-stamp a valid entry with the current time without changing its data.
    pub fn touch(&self, key: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let Some(mut entry) = self.valid_entry(key) else {
            return false;
        };
        entry.written_at = self.clock.now();
        self.write_entry(backend.as_ref(), &entry)
    }

    /// Remove an entry. Returns `false` only if the backend failed.
    pub fn remove(&self, key: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.remove(&self.full_key(key)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache remove {} failed: {}", key, e);
                false
            }
        }
    }

    /// Remove every entry in this cache's namespace. Returns the count removed.
    pub fn clear(&self) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        let keys = match backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache clear failed to list keys: {}", e);
                return 0;
            }
        };

        keys.iter()
            .filter(|k| k.starts_with(&self.config.namespace))
            .filter(|k| backend.remove(k).is_ok())
            .count()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    fn write_entry(&self, backend: &dyn CacheBackend, entry: &CacheEntry) -> bool {
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache entry {} could not be encoded: {}", entry.key, e);
                return false;
            }
        };
        match backend.write(&self.full_key(&entry.key), raw) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Cache write {} to {} backend failed: {}",
                    entry.key,
                    backend.name(),
                    e
                );
                false
            }
        }
    }

    /// Read an entry, evicting it if it is expired, outdated or corrupt.
    fn valid_entry(&self, key: &str) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;
        let raw = match backend.read(&self.full_key(key)) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Cache read {} failed: {}", key, e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Evicting corrupt cache entry {}: {}", key, e);
                self.remove(key);
                return None;
            }
        };

        if !entry.is_valid(self.clock.now(), self.config.schema_version) {
            debug!("Evicting expired cache entry {}", key);
            self.remove(key);
            return None;
        }

        Some(entry)
    }
}
