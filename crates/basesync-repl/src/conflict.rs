//! Last-writer-wins conflict tracking for record events.
//!
//! Winner selection:
//! 1. Later origin timestamp wins
//! 2. Equal timestamps: the lexically higher instance ID wins
//!
//! Every instance applies the same ordering, so all of them pick the same
//! winner. Wall-clock skew between instances is not corrected.

use crate::event::Event;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Position of an event in the last-writer-wins order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Origin timestamp.
    pub timestamp: DateTime<Utc>,
    /// Originating instance; breaks timestamp ties.
    pub instance_id: String,
}

impl Version {
    /// The version of `event`.
    pub fn of(event: &Event) -> Self {
        Self {
            timestamp: event.timestamp(),
            instance_id: event.instance_id().to_string(),
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.instance_id.cmp(&other.instance_id))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Whether an event may be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Apply it.
    Proceed,
    /// A newer version of the record is pending or already applied.
    Superseded {
        /// The version that wins.
        winner: Version,
    },
}

#[derive(Debug, Default)]
struct Tables {
    /// Record key -> most recent event seen but not yet settled.
    pending: HashMap<String, Version>,
    /// Record key -> newest version applied (deletes included).
    applied: HashMap<String, Version>,
    conflicts: u64,
}

/// Pending-conflict table plus per-record applied high-water marks.
///
/// Local and non-persisted. A restarted instance relies on log redelivery
/// order until the marks are rebuilt.
#[derive(Debug)]
pub struct ConflictTable {
    tables: Mutex<Tables>,
    capacity: usize,
}

impl ConflictTable {
    /// Create a table keeping at most `capacity` applied marks.
    pub fn new(capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decide whether `event` wins against what is pending or already applied
    /// for its record. A winning event becomes the pending entry.
    pub fn admit(&self, event: &Event) -> Admission {
        let key = event.record_key();
        let version = Version::of(event);
        let mut tables = self.lock();

        if let Some(applied) = tables.applied.get(&key) {
            if version < *applied {
                let winner = applied.clone();
                tables.conflicts += 1;
                debug!(record = %key, ?winner, loser = ?version, "older than applied version");
                return Admission::Superseded { winner };
            }
        }
        if let Some(pending) = tables.pending.get(&key) {
            match version.cmp(pending) {
                Ordering::Less => {
                    let winner = pending.clone();
                    tables.conflicts += 1;
                    debug!(record = %key, ?winner, loser = ?version, "pending conflict wins");
                    return Admission::Superseded { winner };
                }
                Ordering::Greater => tables.conflicts += 1,
                Ordering::Equal => {}
            }
        }
        tables.pending.insert(key, version);
        Admission::Proceed
    }

    /// Record that `event` was applied (or originated) locally and clear it
    /// from the pending table.
    pub fn settle(&self, event: &Event) {
        let key = event.record_key();
        let version = Version::of(event);
        let mut tables = self.lock();

        if tables.pending.get(&key) == Some(&version) {
            tables.pending.remove(&key);
        }
        let newer = tables
            .applied
            .get(&key)
            .map_or(true, |applied| version > *applied);
        if newer {
            tables.applied.insert(key, version);
        }
        if tables.applied.len() > self.capacity {
            Self::prune(&mut tables, self.capacity);
        }
    }

    /// Drop a pending entry without marking it applied (the apply failed).
    pub fn abandon(&self, event: &Event) {
        let key = event.record_key();
        let version = Version::of(event);
        let mut tables = self.lock();
        if tables.pending.get(&key) == Some(&version) {
            tables.pending.remove(&key);
        }
    }

    /// Forget every mark for a collection (it was deleted).
    pub fn forget_collection(&self, collection: &str) {
        let prefix = format!("{}/", collection);
        let mut tables = self.lock();
        tables.pending.retain(|k, _| !k.starts_with(&prefix));
        tables.applied.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Newest applied version for a record key.
    pub fn applied_version(&self, record_key: &str) -> Option<Version> {
        self.lock().applied.get(record_key).cloned()
    }

    /// Number of conflicts observed (an event compared against a different
    /// version of the same record).
    pub fn conflicts(&self) -> u64 {
        self.lock().conflicts
    }

    /// Number of pending entries.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Remove the oldest half of the applied marks.
    fn prune(tables: &mut Tables, capacity: usize) {
        let mut by_age: Vec<(String, DateTime<Utc>)> = tables
            .applied
            .iter()
            .map(|(k, v)| (k.clone(), v.timestamp))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);
        let excess = tables.applied.len() - capacity / 2;
        for (key, _) in by_age.into_iter().take(excess) {
            tables.applied.remove(&key);
        }
        debug!(
            removed = excess,
            remaining = tables.applied.len(),
            "pruned applied marks"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::Map;

    fn update_at(instance: &str, ts: DateTime<Utc>) -> Event {
        Event::record_updated(instance, "posts", "r1", Map::new()).with_timestamp(ts)
    }

    #[test]
    fn test_later_wins_over_pending() {
        let table = ConflictTable::new(100);
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(1);
        assert_eq!(table.admit(&update_at("b", t2)), Admission::Proceed);
        let older = table.admit(&update_at("a", t1));
        assert!(matches!(older, Admission::Superseded { winner } if winner.timestamp == t2));
    }

    #[test]
    fn test_older_than_applied_is_superseded() {
        let table = ConflictTable::new(100);
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(1);
        let newer = update_at("b", t2);
        assert_eq!(table.admit(&newer), Admission::Proceed);
        table.settle(&newer);
        assert_eq!(table.pending_len(), 0);
        assert!(matches!(
            table.admit(&update_at("a", t1)),
            Admission::Superseded { .. }
        ));
        assert_eq!(table.conflicts(), 1);
    }

    #[test]
    fn test_tie_broken_by_instance_id() {
        let table = ConflictTable::new(100);
        let t = Utc::now();
        let a = update_at("a", t);
        let b = update_at("b", t);
        assert_eq!(table.admit(&a), Admission::Proceed);
        table.settle(&a);
        assert_eq!(table.admit(&b), Admission::Proceed);
        table.settle(&b);
        assert!(matches!(table.admit(&a), Admission::Superseded { .. }));
    }

    #[test]
    fn test_redelivery_of_same_event_proceeds() {
        let table = ConflictTable::new(100);
        let event = update_at("a", Utc::now());
        assert_eq!(table.admit(&event), Admission::Proceed);
        table.settle(&event);
        assert_eq!(table.admit(&event), Admission::Proceed);
    }

    #[test]
    fn test_delete_acts_as_tombstone() {
        let table = ConflictTable::new(100);
        let t1 = Utc::now();
        let delete = Event::record_deleted("b", "posts", "r1").with_timestamp(t1 + Duration::seconds(5));
        table.settle(&delete);
        assert!(matches!(
            table.admit(&update_at("a", t1)),
            Admission::Superseded { .. }
        ));
    }

    #[test]
    fn test_abandon_clears_pending_only() {
        let table = ConflictTable::new(100);
        let event = update_at("a", Utc::now());
        table.admit(&event);
        table.abandon(&event);
        assert_eq!(table.pending_len(), 0);
        assert!(table.applied_version("posts/r1").is_none());
    }

    #[test]
    fn test_forget_collection() {
        let table = ConflictTable::new(100);
        table.settle(&update_at("a", Utc::now()));
        table.forget_collection("posts");
        assert!(table.applied_version("posts/r1").is_none());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let table = ConflictTable::new(4);
        let base = Utc::now();
        for i in 0..5 {
            let e = Event::record_deleted("a", "posts", &format!("r{}", i))
                .with_timestamp(base + Duration::seconds(i));
            table.settle(&e);
        }
        assert!(table.applied_version("posts/r4").is_some());
        assert!(table.applied_version("posts/r0").is_none());
    }

    proptest! {
        #[test]
        fn prop_any_order_settles_on_max(offsets in proptest::collection::vec((0i64..1000, 0usize..3), 1..12)) {
            let ids = ["a", "b", "c"];
            let base = Utc::now();
            let events: Vec<Event> = offsets
                .iter()
                .map(|(ms, who)| update_at(ids[*who], base + Duration::milliseconds(*ms)))
                .collect();
            let expected = events.iter().map(Version::of).max().unwrap();

            let table = ConflictTable::new(100);
            let mut last_applied = None;
            for event in &events {
                if table.admit(event) == Admission::Proceed {
                    table.settle(event);
                    last_applied = Some(Version::of(event));
                }
            }
            prop_assert_eq!(last_applied, Some(expected.clone()));
            prop_assert_eq!(table.applied_version("posts/r1"), Some(expected));
        }
    }
}
