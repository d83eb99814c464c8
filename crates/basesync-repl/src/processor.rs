//! Event processor: idempotent application of remote record and schema events
//! to the local store.
//!
//! Applies are serialized. Record events pass through the [`ConflictTable`]
//! first, so an event that lost last-writer-wins is never written. Creates of
//! existing records degrade to updates and updates of missing records degrade
//! to creates, which makes redelivery and reordering harmless.

use crate::config::ProcessorConfig;
use crate::conflict::{Admission, ConflictTable};
use crate::error::SyncError;
use crate::event::{Event, EventType};
use crate::store::{Collection, LocalStore, Record, StoreError};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const IMMUTABLE_FIELDS: [&str; 2] = ["id", "created"];

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A record or collection was inserted.
    Created,
    /// An existing record or collection was changed.
    Updated,
    /// A record or collection was removed.
    Deleted,
    /// The store already held this state.
    Unchanged,
    /// Nothing was applied; the reason is logged.
    Skipped(String),
    /// A newer version of the record won last-writer-wins.
    Superseded,
}

#[derive(Debug, Default)]
struct ProcessorStatsInner {
    applied: AtomicU64,
    unchanged: AtomicU64,
    skipped: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
    dropped_fields: AtomicU64,
}

/// Snapshot of processor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Events that created, updated or deleted something.
    pub applied: u64,
    /// Events that found the store already up to date.
    pub unchanged: u64,
    /// Events skipped (missing collection, self-originated, excluded).
    pub skipped: u64,
    /// Events that lost last-writer-wins.
    pub superseded: u64,
    /// Events whose apply returned an error.
    pub failed: u64,
    /// Relation fields dropped for dangling references.
    pub dropped_fields: u64,
}

/// Applies remote events to a [`LocalStore`].
pub struct EventProcessor {
    local_id: String,
    store: Arc<dyn LocalStore>,
    config: ProcessorConfig,
    conflicts: ConflictTable,
    apply_lock: Mutex<()>,
    stats: ProcessorStatsInner,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("local_id", &self.local_id)
            .field("config", &self.config)
            .finish()
    }
}

impl EventProcessor {
    /// Create a processor for `local_id` writing into `store`.
    pub fn new(local_id: impl Into<String>, store: Arc<dyn LocalStore>, config: ProcessorConfig) -> Self {
        let capacity = config.conflict_capacity;
        Self {
            local_id: local_id.into(),
            store,
            config,
            conflicts: ConflictTable::new(capacity),
            apply_lock: Mutex::new(()),
            stats: ProcessorStatsInner::default(),
        }
    }

    /// The conflict table (read-only inspection).
    pub fn conflicts(&self) -> &ConflictTable {
        &self.conflicts
    }

    /// Record a locally originated record change so older remote events for
    /// the same record lose against it.
    pub fn record_local(&self, event: &Event) {
        if event.event_type().is_record() {
            self.conflicts.settle(event);
        }
    }

    /// Apply one event. Idempotent.
    pub fn apply(&self, event: &Event) -> Result<ApplyOutcome, SyncError> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());

        let result = if event.instance_id() == self.local_id {
            Ok(ApplyOutcome::Skipped("self-originated".to_string()))
        } else {
            match event.event_type() {
                EventType::Create | EventType::Update | EventType::Delete => {
                    self.apply_record(event)
                }
                EventType::CollectionCreate
                | EventType::CollectionUpdate
                | EventType::CollectionDelete => self.apply_collection(event),
                EventType::RealtimeSubscribe
                | EventType::RealtimeUnsubscribe
                | EventType::RealtimeHeartbeat => Ok(ApplyOutcome::Skipped(
                    "realtime events belong to the lease manager".to_string(),
                )),
            }
        };

        match &result {
            Ok(ApplyOutcome::Created | ApplyOutcome::Updated | ApplyOutcome::Deleted) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ApplyOutcome::Unchanged) => {
                self.stats.unchanged.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ApplyOutcome::Skipped(reason)) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(record = %event.record_key(), reason = %reason, "event skipped");
            }
            Ok(ApplyOutcome::Superseded) => {
                self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    local = %self.local_id,
                    origin = event.instance_id(),
                    record = %event.record_key(),
                    event_type = ?event.event_type(),
                    error = %e,
                    "failed to apply event"
                );
            }
        }
        result
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ProcessorStats {
        let s = &self.stats;
        ProcessorStats {
            applied: s.applied.load(Ordering::Relaxed),
            unchanged: s.unchanged.load(Ordering::Relaxed),
            skipped: s.skipped.load(Ordering::Relaxed),
            superseded: s.superseded.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            dropped_fields: s.dropped_fields.load(Ordering::Relaxed),
        }
    }

    fn apply_record(&self, event: &Event) -> Result<ApplyOutcome, SyncError> {
        let collection = match self.store.find_collection(event.collection()) {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                warn!(
                    collection = event.collection(),
                    record_id = event.record_id(),
                    "collection not found locally, skipping record event"
                );
                return Ok(ApplyOutcome::Skipped(format!(
                    "collection {} not found",
                    event.collection()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Admission::Superseded { winner } = self.conflicts.admit(event) {
            info!(
                record = %event.record_key(),
                loser_origin = event.instance_id(),
                loser_ts = %event.timestamp(),
                winner_origin = %winner.instance_id,
                winner_ts = %winner.timestamp,
                "conflict resolved, event superseded"
            );
            return Ok(ApplyOutcome::Superseded);
        }

        let result = match event.event_type() {
            EventType::Delete => self.delete_record(&collection, event),
            _ => self.upsert_record(&collection, event),
        };
        match &result {
            Ok(_) => self.conflicts.settle(event),
            Err(_) => self.conflicts.abandon(event),
        }
        result
    }

    fn upsert_record(&self, collection: &Collection, event: &Event) -> Result<ApplyOutcome, SyncError> {
        let data = event
            .record_data()
            .ok_or_else(|| SyncError::malformed("record event without recordData"))?;

        match self.find_existing(collection, event.record_id(), data)? {
            Some(existing) => {
                let incoming = self.filter_fields(collection, data, true);
                let mut merged = existing.data.clone();
                for (k, v) in incoming {
                    merged.insert(k, v);
                }
                if self.user_data(&merged) == self.user_data(&existing.data) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                let record = Record {
                    id: existing.id,
                    collection: collection.name.clone(),
                    data: self.user_data(&merged),
                };
                self.store.save_record(record)?;
                debug!(record = %event.record_key(), "record updated");
                Ok(ApplyOutcome::Updated)
            }
            None => {
                let record = Record {
                    id: event.record_id().to_string(),
                    collection: collection.name.clone(),
                    data: self.filter_fields(collection, data, false),
                };
                self.store.save_record(record)?;
                debug!(record = %event.record_key(), "record created");
                Ok(ApplyOutcome::Created)
            }
        }
    }

    fn delete_record(&self, collection: &Collection, event: &Event) -> Result<ApplyOutcome, SyncError> {
        match self.store.delete_record(&collection.name, event.record_id()) {
            Ok(()) => {
                debug!(record = %event.record_key(), "record deleted");
                Ok(ApplyOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(ApplyOutcome::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the local record an event targets: by ID, and for the registry
    /// collection also by its unique key.
    fn find_existing(
        &self,
        collection: &Collection,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<Record>, SyncError> {
        match self.store.find_record(&collection.name, id) {
            Ok(r) => return Ok(Some(r)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if collection.name != self.config.registry_collection {
            return Ok(None);
        }
        let Some(unique) = data.get(&self.config.registry_unique_field) else {
            return Ok(None);
        };
        match self
            .store
            .find_record_by_field(&collection.name, &self.config.registry_unique_field, unique)
        {
            Ok(r) => {
                debug!(
                    collection = %collection.name,
                    remote_id = id,
                    local_id = %r.id,
                    "registry record resolved by unique key"
                );
                Ok(Some(r))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep only schema fields that are safe to copy between instances, and
    /// drop relation fields that reference missing records.
    fn filter_fields(
        &self,
        collection: &Collection,
        data: &Map<String, Value>,
        existing: bool,
    ) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, value) in data {
            if self.config.local_only_fields.iter().any(|f| f == key)
                || self.config.system_fields.iter().any(|f| f == key)
                || key == "id"
                || (existing && IMMUTABLE_FIELDS.contains(&key.as_str()))
            {
                continue;
            }
            let Some(field) = collection.field(key) else {
                debug!(collection = %collection.name, field = %key, "field not in local schema");
                continue;
            };
            if let Some(target) = field.relation_target() {
                if let Err(reason) = self.check_relation(target, value) {
                    self.stats.dropped_fields.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        collection = %collection.name,
                        field = %key,
                        reason = %reason,
                        "dropping relation field"
                    );
                    continue;
                }
            }
            out.insert(key.clone(), value.clone());
        }
        out
    }

    fn check_relation(&self, target: &str, value: &Value) -> Result<(), String> {
        let ids: Vec<&str> = match value {
            Value::Null => return Ok(()),
            Value::String(s) if s.is_empty() => return Ok(()),
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => ids.push(s),
                        None => return Err(format!("non-string reference {}", item)),
                    }
                }
                ids
            }
            other => return Err(format!("unexpected relation value {}", other)),
        };
        if ids.is_empty() {
            return Ok(());
        }
        let target = self
            .store
            .find_collection(target)
            .map_err(|e| format!("referenced collection {}: {}", target, e))?;
        for id in ids {
            match self.store.find_record(&target.name, id) {
                Ok(_) => {}
                Err(StoreError::NotFound { .. }) => {
                    return Err(format!("referenced record {}/{} not found", target.name, id))
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(())
    }

    fn user_data(&self, data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .filter(|(k, _)| !self.config.system_fields.iter().any(|f| f == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn apply_collection(&self, event: &Event) -> Result<ApplyOutcome, SyncError> {
        let name = event.collection();
        if name == self.config.registry_collection {
            return Ok(ApplyOutcome::Skipped(format!(
                "{} is never replicated",
                name
            )));
        }

        if event.event_type() == EventType::CollectionDelete {
            return match self.store.delete_collection(name) {
                Ok(()) => {
                    self.conflicts.forget_collection(name);
                    info!(collection = name, "collection deleted");
                    Ok(ApplyOutcome::Deleted)
                }
                Err(e) if e.is_not_found() => Ok(ApplyOutcome::Unchanged),
                Err(e) => Err(e.into()),
            };
        }

        let incoming = event.schema()?;

        let existing = match self.store.find_collection(name) {
            Ok(c) => Some(c),
            Err(e) if e.is_not_found() => match self.store.find_collection(&incoming.id) {
                Ok(c) => Some(c),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(current) => {
                let mut replaced = current.clone();
                replaced.name = incoming.name;
                replaced.kind = incoming.kind;
                replaced.fields = incoming.fields;
                replaced.indexes = incoming.indexes;
                if replaced == current {
                    return Ok(ApplyOutcome::Unchanged);
                }
                self.store.save_collection(replaced)?;
                info!(collection = name, "collection schema replaced");
                Ok(ApplyOutcome::Updated)
            }
            None => {
                self.store.save_collection(incoming)?;
                info!(collection = name, "collection created");
                Ok(ApplyOutcome::Created)
            }
        }
    }
}
