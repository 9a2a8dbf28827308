//! Timestamp-based conflict resolution.
//!
//! Versions are compared by [`Synchronizable::last_modified`]: the strictly
//! newer side wins, ties go to the local copy, and a missing side loses
//! without comparison. Resolution never fails.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use prepsync_common::Synchronizable;

/// Which copy a decision picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSource {
    Local,
    Remote,
}

/// Outcome of resolving one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecision<T> {
    pub data: T,
    pub source: ConflictSource,
}

impl<T> ConflictDecision<T> {
    fn local(data: T) -> Self {
        Self {
            data,
            source: ConflictSource::Local,
        }
    }

    fn remote(data: T) -> Self {
        Self {
            data,
            source: ConflictSource::Remote,
        }
    }

    /// Whether the remote copy won.
    pub fn is_remote(&self) -> bool {
        self.source == ConflictSource::Remote
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newer `last_modified` wins, ties favor local.
    #[default]
    LastWriteWins,
    /// Local copy wins whenever it exists.
    PreferLocal,
    /// Remote copy wins whenever it exists.
    PreferRemote,
}

/// Resolves local/remote divergence for synchronizable entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a resolver with the given strategy.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    /// Get the resolution strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Pick the authoritative version of one entity.
    ///
    /// Returns `None` only when both sides are absent.
    pub fn resolve<T: Synchronizable>(
        &self,
        local: Option<T>,
        remote: Option<T>,
    ) -> Option<ConflictDecision<T>> {
        match (local, remote) {
            (None, None) => None,
            (Some(local), None) => Some(ConflictDecision::local(local)),
            (None, Some(remote)) => Some(ConflictDecision::remote(remote)),
            (Some(local), Some(remote)) => Some(match self.strategy {
                ConflictStrategy::PreferLocal => ConflictDecision::local(local),
                ConflictStrategy::PreferRemote => ConflictDecision::remote(remote),
                ConflictStrategy::LastWriteWins => {
                    if remote.last_modified() > local.last_modified() {
                        ConflictDecision::remote(remote)
                    } else {
                        ConflictDecision::local(local)
                    }
                }
            }),
        }
    }

    /// Union two lists keyed by entity id, resolving each id independently.
    ///
    /// Order: local ids first in their original order, then remote-only ids.
    pub fn merge_decisions<T: Synchronizable>(
        &self,
        local: Vec<T>,
        remote: Vec<T>,
    ) -> Vec<ConflictDecision<T>> {
        let mut order: Vec<String> = Vec::new();
        let mut locals: HashMap<String, T> = HashMap::new();
        let mut remotes: HashMap<String, T> = HashMap::new();

        for item in local {
            insert_newest(&mut locals, &mut order, item);
        }
        for item in remote {
            insert_newest(&mut remotes, &mut order, item);
        }

        order
            .into_iter()
            .filter_map(|id| self.resolve(locals.remove(&id), remotes.remove(&id)))
            .collect()
    }

    /// Like [`merge_decisions`](Self::merge_decisions) but returns only the data.
    pub fn merge_by_id<T: Synchronizable>(&self, local: Vec<T>, remote: Vec<T>) -> Vec<T> {
        self.merge_decisions(local, remote)
            .into_iter()
            .map(|d| d.data)
            .collect()
    }
}

/// Resolve with the default last-write-wins strategy.
pub fn resolve<T: Synchronizable>(local: Option<T>, remote: Option<T>) -> Option<ConflictDecision<T>> {
    ConflictResolver::default().resolve(local, remote)
}

/// Merge with the default last-write-wins strategy.
pub fn merge_by_id<T: Synchronizable>(local: Vec<T>, remote: Vec<T>) -> Vec<T> {
    ConflictResolver::default().merge_by_id(local, remote)
}

fn insert_newest<T: Synchronizable>(map: &mut HashMap<String, T>, order: &mut Vec<String>, item: T) {
    let id = item.entity_id().to_string();
    match map.get(&id) {
        Some(existing) if existing.last_modified() >= item.last_modified() => {}
        Some(_) => {
            map.insert(id, item);
        }
        None => {
            if !order.contains(&id) {
                order.push(id.clone());
            }
            map.insert(id, item);
        }
    }
}

/// Migration helpers for records written before `lastModified` existed.
///
/// Old records stamped recency under several field names. These helpers search
/// them in a fixed order so such records can be resolved or re-stamped once.
pub mod legacy {
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    use super::{ConflictDecision, ConflictSource};

    /// Field names searched for a timestamp, first match wins.
    pub const TIMESTAMP_FIELDS: [&str; 7] = [
        "lastModified",
        "updatedAt",
        "updated_at",
        "lastUpdated",
        "timestamp",
        "completedAt",
        "createdAt",
    ];

    /// Extract a record's timestamp.
    ///
    /// Accepts epoch milliseconds or RFC 3339 strings. A record with no known
    /// field, or whose first known field is malformed, has timestamp zero.
    pub fn extract_timestamp(record: &Value) -> DateTime<Utc> {
        TIMESTAMP_FIELDS
            .iter()
            .find_map(|field| record.get(*field).filter(|v| !v.is_null()))
            .and_then(parse_timestamp)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(DateTime::from_timestamp_millis),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)),
            _ => None,
        }
    }

    /// Resolve two untyped records by their detected timestamps.
    pub fn resolve_values(
        local: Option<Value>,
        remote: Option<Value>,
    ) -> Option<ConflictDecision<Value>> {
        match (local, remote) {
            (None, None) => None,
            (Some(local), None) => Some(ConflictDecision {
                data: local,
                source: ConflictSource::Local,
            }),
            (None, Some(remote)) => Some(ConflictDecision {
                data: remote,
                source: ConflictSource::Remote,
            }),
            (Some(local), Some(remote)) => {
                if extract_timestamp(&remote) > extract_timestamp(&local) {
                    Some(ConflictDecision {
                        data: remote,
                        source: ConflictSource::Remote,
                    })
                } else {
                    Some(ConflictDecision {
                        data: local,
                        source: ConflictSource::Local,
                    })
                }
            }
        }
    }

    /// Stamp `lastModified` on a legacy record object from its detected timestamp.
    ///
    /// Non-object values are returned unchanged.
    pub fn migrate(mut record: Value) -> Value {
        let stamp = extract_timestamp(&record);
        if let Value::Object(map) = &mut record {
            map.insert("lastModified".to_string(), Value::String(stamp.to_rfc3339()));
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        at: DateTime<Utc>,
        tag: &'static str,
    }

    impl Synchronizable for Item {
        fn entity_id(&self) -> &str {
            self.id
        }

        fn last_modified(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn item(id: &'static str, offset_ms: i64, tag: &'static str) -> Item {
        Item {
            id,
            at: DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(offset_ms),
            tag,
        }
    }

    #[test]
    fn test_newer_remote_wins() {
        let d = resolve(Some(item("a", 1, "l")), Some(item("a", 2, "r"))).unwrap();
        assert_eq!(d.source, ConflictSource::Remote);
        assert_eq!(d.data.tag, "r");
    }

    #[test]
    fn test_newer_local_wins() {
        let d = resolve(Some(item("a", 5, "l")), Some(item("a", 2, "r"))).unwrap();
        assert_eq!(d.source, ConflictSource::Local);
    }

    #[test]
    fn test_tie_favors_local() {
        let d = resolve(Some(item("a", 3, "l")), Some(item("a", 3, "r"))).unwrap();
        assert_eq!(d.source, ConflictSource::Local);
        assert_eq!(d.data.tag, "l");
    }

    #[test]
    fn test_absent_sides() {
        assert!(resolve::<Item>(None, None).is_none());
        assert_eq!(resolve(None, Some(item("a", 0, "r"))).unwrap().source, ConflictSource::Remote);
        assert_eq!(resolve(Some(item("a", 0, "l")), None).unwrap().source, ConflictSource::Local);
    }

    #[test]
    fn test_strategies_override_timestamps() {
        let local = Some(item("a", 1, "l"));
        let remote = Some(item("a", 9, "r"));

        let prefer_local = ConflictResolver::new(ConflictStrategy::PreferLocal);
        assert_eq!(prefer_local.resolve(local.clone(), remote.clone()).unwrap().data.tag, "l");

        let prefer_remote = ConflictResolver::new(ConflictStrategy::PreferRemote);
        assert_eq!(prefer_remote.resolve(local, remote).unwrap().data.tag, "r");
    }

    #[test]
    fn test_merge_by_id_union() {
        let local = vec![item("a", 10, "l"), item("b", 1, "l")];
        let remote = vec![item("b", 5, "r"), item("c", 0, "r")];

        let merged = merge_by_id(local, remote);
        let summary: Vec<_> = merged.iter().map(|i| (i.id, i.tag)).collect();
        assert_eq!(summary, vec![("a", "l"), ("b", "r"), ("c", "r")]);
    }

    #[test]
    fn test_merge_collapses_duplicates_within_side() {
        let local = vec![item("a", 1, "old"), item("a", 7, "new")];
        let merged = merge_by_id(local, Vec::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tag, "new");
    }

    #[test]
    fn test_legacy_field_priority() {
        let record = json!({ "updatedAt": 2000, "createdAt": 9000 });
        assert_eq!(legacy::extract_timestamp(&record).timestamp_millis(), 2000);

        let rfc = json!({ "timestamp": "2024-05-01T10:00:00Z" });
        assert_eq!(legacy::extract_timestamp(&rfc).to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_legacy_missing_or_malformed_is_zero() {
        assert_eq!(legacy::extract_timestamp(&json!({ "x": 1 })), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            legacy::extract_timestamp(&json!({ "updatedAt": "yesterday" })),
            DateTime::<Utc>::UNIX_EPOCH
        );
        assert_eq!(legacy::extract_timestamp(&json!("scalar")), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_legacy_resolve_values() {
        // Only one side carries a comparable timestamp: the other is zero.
        let d = legacy::resolve_values(Some(json!({"v": "l"})), Some(json!({"v": "r", "updated_at": 1})))
            .unwrap();
        assert_eq!(d.source, ConflictSource::Remote);

        // Neither side has a timestamp: tie, local wins.
        let d = legacy::resolve_values(Some(json!({"v": "l"})), Some(json!({"v": "r"}))).unwrap();
        assert_eq!(d.source, ConflictSource::Local);

        assert!(legacy::resolve_values(None, None).is_none());
    }

    #[test]
    fn test_legacy_migrate_stamps_last_modified() {
        let migrated = legacy::migrate(json!({ "completedAt": 1_700_000_000_000i64 }));
        assert_eq!(
            legacy::extract_timestamp(&migrated).timestamp_millis(),
            1_700_000_000_000
        );
        assert!(migrated["lastModified"].is_string());
    }

    proptest::proptest! {
        #[test]
        fn prop_resolve_picks_later_or_local_on_tie(l in 0i64..1_000_000, r in 0i64..1_000_000) {
            let d = resolve(Some(item("a", l, "l")), Some(item("a", r, "r"))).unwrap();
            if r > l {
                proptest::prop_assert_eq!(d.source, ConflictSource::Remote);
            } else {
                proptest::prop_assert_eq!(d.source, ConflictSource::Local);
            }
        }
    }
}
