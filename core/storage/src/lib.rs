//! Local persistence layers for the PrepSync engine.
//!
//! Two layers sit in front of the remote authoritative store:
//! - [`EphemeralCache`]: a synchronous TTL key/value cache for small, hot data
//! - [`DurableStore`]: an indexed, per-record transactional store for bulky
//!   entities (question sets, attempts, results)
//!
//! # Design Principles
//! - Accelerators only: every failure degrades to "not cached", never to data loss
//! - Backend isolation: cache and store engines are swappable behind traits
//! - Injected time: expiry and stamping read a [`prepsync_common::Clock`]

pub mod backend;
pub mod cache;
pub mod collection;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use backend::{CacheBackend, MemoryBackend};
pub use cache::{CacheConfig, CacheEntry, EphemeralCache};
pub use collection::{Collection, IndexQuery, PersistedEntity};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{open_or_disabled, DisabledStore, DurableStore};
