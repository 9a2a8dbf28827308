//! Common utilities and types shared across PrepSync crates.
//!
//! This crate provides the error taxonomy, strongly-typed identifiers, the
//! injectable clock and the progress entity that every other layer of the
//! sync engine passes around.

pub mod clock;
pub mod error;
pub mod progress;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, Result};
pub use progress::{ProgressRecord, ProgressStatus};
pub use types::{AttemptId, OwnerId, Synchronizable};
