//! Collections, indexes and the persisted entity envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use prepsync_common::{Error, ProgressRecord, Result};

/// Named collection in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Downloaded question content, keyed by exam id.
    QuestionSets,
    /// In-progress and completed exam attempts.
    Attempts,
    /// Scored results of completed attempts.
    Results,
}

impl Collection {
    /// All collections, in schema order.
    pub const ALL: [Collection; 3] = [
        Collection::QuestionSets,
        Collection::Attempts,
        Collection::Results,
    ];

    /// Table / collection name in the persisted layout.
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::QuestionSets => "question_sets",
            Collection::Attempts => "attempts",
            Collection::Results => "results",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Secondary index lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// Entities owned by a user.
    Owner(String),
    /// Entities whose parent (exam / attempt) matches.
    Parent(String),
    /// Entities in a lifecycle status.
    Status(String),
    /// Entities updated at or after the given instant.
    UpdatedSince(DateTime<Utc>),
}

impl IndexQuery {
    /// Whether `entity` satisfies this query.
    pub fn matches(&self, entity: &PersistedEntity) -> bool {
        match self {
            IndexQuery::Owner(owner) => entity.owner_id.as_deref() == Some(owner.as_str()),
            IndexQuery::Parent(parent) => entity.parent_id.as_deref() == Some(parent.as_str()),
            IndexQuery::Status(status) => entity.status.as_deref() == Some(status.as_str()),
            IndexQuery::UpdatedSince(since) => entity.last_updated >= *since,
        }
    }
}

/// A record stored in one of the collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntity {
    pub id: String,
    pub owner_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: Option<String>,
    /// Stamped by the store on every `put`.
    pub last_updated: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PersistedEntity {
    /// Create an entity envelope. `last_updated` is overwritten on `put`.
    ///
    /// # Errors
    /// - `InvalidInput` if `id` is empty
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".to_string()));
        }
        Ok(Self {
            id,
            owner_id: None,
            parent_id: None,
            status: None,
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
            payload,
        })
    }

    /// Set the owner foreign key.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    /// Set the parent foreign key.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Set the status index value.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Wrap a progress record for the `Attempts` collection.
    pub fn from_progress(record: &ProgressRecord) -> Result<Self> {
        let payload = serde_json::to_value(record)?;
        Ok(Self::new(record.attempt_id.as_str(), payload)?
            .with_owner(record.owner_id.as_str())
            .with_parent(record.exam_id.clone())
            .with_status(record.status.as_str()))
    }

    /// Decode the payload as a progress record.
    pub fn to_progress(&self) -> Result<ProgressRecord> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prepsync_common::{AttemptId, OwnerId};

    #[test]
    fn test_empty_id_rejected() {
        assert!(PersistedEntity::new("", serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_progress_envelope_sets_foreign_keys() {
        let record = ProgressRecord::new(
            AttemptId::new("a1").unwrap(),
            OwnerId::new("u1").unwrap(),
            "exam-1",
            Utc::now(),
        );
        let entity = PersistedEntity::from_progress(&record).unwrap();

        assert_eq!(entity.id, "a1");
        assert_eq!(entity.owner_id.as_deref(), Some("u1"));
        assert_eq!(entity.parent_id.as_deref(), Some("exam-1"));
        assert_eq!(entity.status.as_deref(), Some("not_started"));
        assert_eq!(entity.to_progress().unwrap(), record);
    }

    #[test]
    fn test_index_query_matching() {
        let entity = PersistedEntity::new("r1", serde_json::json!({}))
            .unwrap()
            .with_owner("u1")
            .with_status("completed");

        assert!(IndexQuery::Owner("u1".into()).matches(&entity));
        assert!(!IndexQuery::Owner("u2".into()).matches(&entity));
        assert!(IndexQuery::Status("completed".into()).matches(&entity));
        assert!(!IndexQuery::Parent("exam".into()).matches(&entity));
        assert!(IndexQuery::UpdatedSince(DateTime::<Utc>::UNIX_EPOCH).matches(&entity));
    }
}
