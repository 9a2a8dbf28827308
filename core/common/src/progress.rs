//! In-progress exam attempt state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{AttemptId, OwnerId, Synchronizable};
use crate::{Error, Result};

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl ProgressStatus {
    /// Value stored in the durable store's status index.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }
}

/// Snapshot of one exam attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub attempt_id: AttemptId,
    pub owner_id: OwnerId,
    /// Exam / question set this attempt belongs to.
    pub exam_id: String,
    pub current_index: u32,
    /// Sparse map of question index to selected choice indices.
    #[serde(default)]
    pub answers: BTreeMap<u32, BTreeSet<u32>>,
    #[serde(default)]
    pub elapsed_secs: u64,
    #[serde(default)]
    pub paused: bool,
    pub status: ProgressStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// Create a record for an attempt that has not been started yet.
    pub fn new(
        attempt_id: AttemptId,
        owner_id: OwnerId,
        exam_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt_id,
            owner_id,
            exam_id: exam_id.into(),
            current_index: 0,
            answers: BTreeMap::new(),
            elapsed_secs: 0,
            paused: false,
            status: ProgressStatus::NotStarted,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Transition `not_started -> in_progress`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if self.status == ProgressStatus::NotStarted {
            self.status = ProgressStatus::InProgress;
            self.started_at = now;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Record the selected choices for a question.
    ///
    /// An empty selection clears the answer.
    pub fn answer(
        &mut self,
        question: u32,
        choices: impl IntoIterator<Item = u32>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let choices: BTreeSet<u32> = choices.into_iter().collect();
        if choices.is_empty() {
            self.answers.remove(&question);
        } else {
            self.answers.insert(question, choices);
        }
        self.touch_in_progress(now);
        Ok(())
    }

    /// Move to another question.
    pub fn navigate(&mut self, index: u32, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        self.current_index = index;
        self.touch_in_progress(now);
        Ok(())
    }

    /// Pause or resume the attempt timer.
    pub fn set_paused(&mut self, paused: bool, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        self.paused = paused;
        self.updated_at = now;
        Ok(())
    }

    /// Add elapsed seconds to the attempt timer.
    pub fn add_elapsed(&mut self, secs: u64, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        self.elapsed_secs = self.elapsed_secs.saturating_add(secs);
        self.updated_at = now;
        Ok(())
    }

    /// Finalize the attempt. Completed records are immutable afterwards.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        self.status = ProgressStatus::Completed;
        self.paused = false;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Whether the attempt has been finalized.
    pub fn is_completed(&self) -> bool {
        self.status == ProgressStatus::Completed
    }

    /// Number of questions with a recorded answer.
    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    fn touch_in_progress(&mut self, now: DateTime<Utc>) {
        if self.status == ProgressStatus::NotStarted {
            self.status = ProgressStatus::InProgress;
        }
        self.updated_at = now;
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_completed() {
            return Err(Error::NotPermitted(format!(
                "attempt {} is completed",
                self.attempt_id
            )));
        }
        Ok(())
    }
}

impl Synchronizable for ProgressRecord {
    fn entity_id(&self) -> &str {
        self.attempt_id.as_str()
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> (ProgressRecord, DateTime<Utc>) {
        let now = Utc::now();
        let rec = ProgressRecord::new(
            AttemptId::new("a1").unwrap(),
            OwnerId::new("u1").unwrap(),
            "exam-aws-saa",
            now,
        );
        (rec, now)
    }

    #[test]
    fn test_answer_moves_to_in_progress() {
        let (mut rec, now) = record();
        let later = now + Duration::seconds(3);
        rec.answer(2, [1, 3], later).unwrap();

        assert_eq!(rec.status, ProgressStatus::InProgress);
        assert_eq!(rec.updated_at, later);
        assert_eq!(rec.answers[&2], BTreeSet::from([1, 3]));
    }

    #[test]
    fn test_empty_answer_clears_entry() {
        let (mut rec, now) = record();
        rec.answer(0, [2], now).unwrap();
        rec.answer(0, [], now).unwrap();
        assert_eq!(rec.answered_count(), 0);
    }

    #[test]
    fn test_completed_is_immutable() {
        let (mut rec, now) = record();
        rec.start(now).unwrap();
        rec.complete(now).unwrap();

        assert!(rec.is_completed());
        assert!(rec.navigate(4, now).is_err());
        assert!(rec.complete(now).is_err());
    }

    #[test]
    fn test_json_shape() {
        let (mut rec, now) = record();
        rec.answer(7, [0], now).unwrap();
        let json = serde_json::to_value(&rec).unwrap();

        assert_eq!(json["attemptId"], "a1");
        assert_eq!(json["status"], "in_progress");
        assert!(json["answers"]["7"].is_array());

        let back: ProgressRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }
}
