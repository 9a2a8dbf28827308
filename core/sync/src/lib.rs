//! PrepSync Sync Engine
//!
//! This crate keeps exam attempt progress consistent between the local
//! layers and the remote authoritative store:
//! - Priority sync queue with a single-flight drain loop and backoff
//! - Last-write-wins conflict resolution
//! - Debounced progress writes with forced flushes on lifecycle events
//! - Connectivity monitoring and per-entity sync state

pub mod adapter;
pub mod config;
pub mod conflict;
pub mod event;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;

// Re-export main types
pub use adapter::{adapter_fn, AdapterRegistry, FnAdapter, RemoteFetchAdapter, RemoteSyncAdapter};
pub use config::EngineConfig;
pub use conflict::{ConflictDecision, ConflictResolver, ConflictSource, ConflictStrategy};
pub use event::SyncEvent;
pub use monitor::{LifecycleEvent, NetworkMonitor};
pub use orchestrator::{OrchestratorBuilder, OrchestratorConfig, ProgressOrchestrator};
pub use queue::{DrainReport, QueueConfig, QueueStatus, SyncQueue};
pub use remote::MemoryRemote;
pub use retry::BackoffPolicy;
pub use scheduler::Debouncer;
pub use state::{SyncEntry, SyncState, SyncStatus};
pub use task::{EnqueueOptions, Priority, SyncTask, TaskKind, TaskState};
