//! Common types used throughout PrepSync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", $label, " from a string.")]
            ///
            /// # Errors
            /// - Returns `InvalidInput` if the id is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(concat!(
                        $label,
                        " cannot be empty"
                    )
                    .to_string()));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for one exam attempt.
    AttemptId,
    "AttemptId"
);

string_id!(
    /// Identifier of the user owning an entity.
    OwnerId,
    "OwnerId"
);

/// An entity that can be reconciled against its remote copy.
///
/// `last_modified` is the single authoritative recency stamp used for
/// last-write-wins comparisons.
pub trait Synchronizable {
    /// Stable identity of the entity across local and remote copies.
    fn entity_id(&self) -> &str;

    /// When this version of the entity was last written.
    fn last_modified(&self) -> DateTime<Utc>;
}
