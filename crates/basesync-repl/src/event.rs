//! The replicated change-notification model.
//!
//! An [`Event`] describes one record mutation, schema mutation or realtime
//! ownership change. Events are immutable once built; the receiving side may
//! only re-tag their [`EventSource`].

use crate::error::SyncError;
use crate::store::Collection;
use basesync_log::subject::sanitize_token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Subject token used for realtime lease traffic.
pub const REALTIME_TOPIC: &str = "_realtime";

/// Kind of change an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Record created.
    Create,
    /// Record updated.
    Update,
    /// Record deleted.
    Delete,
    /// Collection created.
    CollectionCreate,
    /// Collection schema replaced.
    CollectionUpdate,
    /// Collection deleted.
    CollectionDelete,
    /// Realtime subscription claimed.
    RealtimeSubscribe,
    /// Realtime subscription released.
    RealtimeUnsubscribe,
    /// Realtime lease refreshed.
    RealtimeHeartbeat,
}

impl EventType {
    /// Record create/update/delete.
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }

    /// Collection schema mutation.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Self::CollectionCreate | Self::CollectionUpdate | Self::CollectionDelete
        )
    }

    /// Realtime lease traffic.
    pub fn is_realtime(&self) -> bool {
        matches!(
            self,
            Self::RealtimeSubscribe | Self::RealtimeUnsubscribe | Self::RealtimeHeartbeat
        )
    }
}

/// Where the local copy of an event came from. Never transported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSource {
    /// Built by this instance.
    #[default]
    Local,
    /// Consumed from a log.
    Remote,
    /// Re-broadcast by an instance other than (or in addition to) the originator.
    Republished,
}

/// A replicated change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    instance_id: String,
    #[serde(skip)]
    source: EventSource,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    collection: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    realtime_data: Option<Map<String, Value>>,
}

impl Event {
    fn base(event_type: EventType, instance_id: &str, collection: &str) -> Self {
        Self {
            event_type,
            instance_id: instance_id.to_string(),
            source: EventSource::Local,
            timestamp: Utc::now(),
            collection: collection.to_string(),
            record_id: String::new(),
            record_data: None,
            schema_data: None,
            realtime_data: None,
        }
    }

    /// A record was created.
    pub fn record_created(
        instance_id: &str,
        collection: &str,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Self {
        let mut event = Self::base(EventType::Create, instance_id, collection);
        event.record_id = record_id.to_string();
        event.record_data = Some(data);
        event
    }

    /// A record was updated.
    pub fn record_updated(
        instance_id: &str,
        collection: &str,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Self {
        let mut event = Self::base(EventType::Update, instance_id, collection);
        event.record_id = record_id.to_string();
        event.record_data = Some(data);
        event
    }

    /// A record was deleted.
    pub fn record_deleted(instance_id: &str, collection: &str, record_id: &str) -> Self {
        let mut event = Self::base(EventType::Delete, instance_id, collection);
        event.record_id = record_id.to_string();
        event
    }

    /// A collection was created; `schema` is the serialized collection.
    pub fn collection_created(instance_id: &str, name: &str, schema: Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::CollectionCreate, instance_id, name);
        event.schema_data = Some(schema);
        event
    }

    /// A collection's schema was replaced.
    pub fn collection_updated(instance_id: &str, name: &str, schema: Map<String, Value>) -> Self {
        let mut event = Self::base(EventType::CollectionUpdate, instance_id, name);
        event.schema_data = Some(schema);
        event
    }

    /// A collection was deleted.
    pub fn collection_deleted(instance_id: &str, name: &str) -> Self {
        Self::base(EventType::CollectionDelete, instance_id, name)
    }

    /// Realtime lease traffic for `resource_id`.
    pub fn realtime(
        event_type: EventType,
        instance_id: &str,
        resource_id: &str,
        data: Map<String, Value>,
    ) -> Result<Self, SyncError> {
        if !event_type.is_realtime() {
            return Err(SyncError::malformed(format!(
                "{:?} is not a realtime event type",
                event_type
            )));
        }
        let mut event = Self::base(event_type, instance_id, REALTIME_TOPIC);
        event.record_id = resource_id.to_string();
        event.realtime_data = Some(data);
        Ok(event)
    }

    /// Override the origination time. Only meaningful before publishing.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A copy tagged as republished. Origin and timestamp are preserved.
    pub fn republished(&self) -> Self {
        let mut event = self.clone();
        event.source = EventSource::Republished;
        event
    }

    /// Tag an event consumed from a log.
    pub fn mark_remote(&mut self) {
        self.source = EventSource::Remote;
    }

    /// Change kind.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Originating instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Local provenance tag.
    pub fn source(&self) -> EventSource {
        self.source
    }

    /// Origination time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Collection name (schema events: the mutated collection).
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Record ID (realtime events: the resource ID).
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Record payload.
    pub fn record_data(&self) -> Option<&Map<String, Value>> {
        self.record_data.as_ref()
    }

    /// Schema payload.
    pub fn schema_data(&self) -> Option<&Map<String, Value>> {
        self.schema_data.as_ref()
    }

    /// Realtime payload.
    pub fn realtime_data(&self) -> Option<&Map<String, Value>> {
        self.realtime_data.as_ref()
    }

    /// Key addressing the record this event targets.
    pub fn record_key(&self) -> String {
        format!("{}/{}", self.collection, self.record_id)
    }

    /// Subject this event is published on.
    pub fn subject(&self, namespace: &str) -> String {
        if self.event_type.is_realtime() {
            format!("{}.sync.{}", namespace, REALTIME_TOPIC)
        } else {
            format!("{}.sync.{}", namespace, sanitize_token(&self.collection))
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate a wire payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let event: Event = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }

    /// Check that the payload matches the event type.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.instance_id.is_empty() {
            return Err(SyncError::malformed("missing instanceId"));
        }
        if self.collection.is_empty() {
            return Err(SyncError::malformed("missing collection"));
        }
        let payloads = (
            self.record_data.is_some(),
            self.schema_data.is_some(),
            self.realtime_data.is_some(),
        );
        let ok = match self.event_type {
            EventType::Create | EventType::Update => {
                !self.record_id.is_empty() && payloads == (true, false, false)
            }
            EventType::Delete => !self.record_id.is_empty() && payloads == (false, false, false),
            EventType::CollectionCreate | EventType::CollectionUpdate => {
                payloads == (false, true, false)
            }
            EventType::CollectionDelete => payloads == (false, false, false),
            EventType::RealtimeSubscribe
            | EventType::RealtimeUnsubscribe
            | EventType::RealtimeHeartbeat => {
                !self.record_id.is_empty() && payloads == (false, false, true)
            }
        };
        if !ok {
            return Err(SyncError::malformed(format!(
                "payload does not match event type {:?}",
                self.event_type
            )));
        }
        if matches!(
            self.event_type,
            EventType::CollectionCreate | EventType::CollectionUpdate
        ) {
            self.schema()?;
        }
        Ok(())
    }

    /// The collection definition carried by a schema event.
    pub fn schema(&self) -> Result<Collection, SyncError> {
        let data = self
            .schema_data
            .as_ref()
            .ok_or_else(|| SyncError::malformed("collection event without schemaData"))?;
        let collection: Collection = serde_json::from_value(Value::Object(data.clone()))
            .map_err(|e| SyncError::malformed(format!("invalid schemaData: {}", e)))?;
        if collection.name != self.collection {
            return Err(SyncError::malformed(format!(
                "schema name {} does not match event collection {}",
                collection.name, self.collection
            )));
        }
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn data() -> Map<String, Value> {
        json!({"title": "hello"}).as_object().cloned().unwrap()
    }

    #[test]
    fn test_wire_format() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let event = Event::record_created("a", "posts", "r1", data()).with_timestamp(ts);
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "create");
        assert_eq!(wire["instanceId"], "a");
        assert_eq!(wire["collection"], "posts");
        assert_eq!(wire["recordId"], "r1");
        assert_eq!(wire["recordData"]["title"], "hello");
        assert!(wire.get("source").is_none());
        assert!(wire.get("schemaData").is_none());
        assert_eq!(wire["timestamp"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn test_decode_marks_nothing_until_consumed() {
        let event = Event::record_updated("a", "posts", "r1", data());
        let mut decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.source(), EventSource::Local);
        decoded.mark_remote();
        assert_eq!(decoded.source(), EventSource::Remote);
        assert_eq!(decoded.instance_id(), "a");
        assert_eq!(decoded.timestamp(), event.timestamp());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Event::decode(b"not json"),
            Err(SyncError::Serialization(_))
        ));
        assert!(Event::decode(br#"{"instanceId":"a","collection":"posts"}"#).is_err());
        assert!(Event::decode(
            br#"{"type":"explode","instanceId":"a","timestamp":"2026-01-01T00:00:00Z","collection":"posts"}"#
        )
        .is_err());
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let raw = json!({
            "type": "create",
            "instanceId": "a",
            "timestamp": "2026-01-01T00:00:00Z",
            "collection": "posts",
            "recordId": "r1",
            "schemaData": {"name": "posts"}
        });
        let err = Event::decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { .. }));

        let delete_without_id = json!({
            "type": "delete",
            "instanceId": "a",
            "timestamp": "2026-01-01T00:00:00Z",
            "collection": "posts"
        });
        assert!(Event::decode(&serde_json::to_vec(&delete_without_id).unwrap()).is_err());
    }

    #[test]
    fn test_decode_rejects_unparseable_schema() {
        let raw = |schema: Value| {
            serde_json::to_vec(&json!({
                "type": "collection_create",
                "instanceId": "b",
                "timestamp": "2026-01-01T00:00:00Z",
                "collection": "tags",
                "schemaData": schema
            }))
            .unwrap()
        };
        let err = Event::decode(&raw(json!({"name": 5}))).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { .. }));
        assert!(Event::decode(&raw(json!({"id": "c1", "name": "other"}))).is_err());

        let event = Event::decode(&raw(json!({"id": "c1", "name": "tags"}))).unwrap();
        assert_eq!(event.schema().unwrap().id, "c1");
    }

    #[test]
    fn test_republished_keeps_origin() {
        let event = Event::record_deleted("a", "posts", "r1");
        let again = event.republished();
        assert_eq!(again.source(), EventSource::Republished);
        assert_eq!(again.instance_id(), "a");
        assert_eq!(again.timestamp(), event.timestamp());
        assert_eq!(again.event_type(), EventType::Delete);
    }

    #[test]
    fn test_subjects() {
        let record = Event::record_deleted("a", "my posts", "r1");
        assert_eq!(record.subject("app"), "app.sync.my_posts");
        let schema = Event::collection_deleted("a", "posts");
        assert_eq!(schema.subject("app"), "app.sync.posts");
        let rt = Event::realtime(EventType::RealtimeHeartbeat, "a", "posts", Map::new()).unwrap();
        assert_eq!(rt.subject("app"), "app.sync._realtime");
        assert_eq!(rt.record_id(), "posts");
    }

    #[test]
    fn test_realtime_requires_realtime_type() {
        assert!(Event::realtime(EventType::Create, "a", "posts", Map::new()).is_err());
    }

    #[test]
    fn test_type_classes() {
        assert!(EventType::Update.is_record());
        assert!(EventType::CollectionUpdate.is_collection());
        assert!(EventType::RealtimeHeartbeat.is_realtime());
        assert!(!EventType::Delete.is_realtime());
    }

    #[test]
    fn test_record_key() {
        let event = Event::record_deleted("a", "posts", "r1");
        assert_eq!(event.record_key(), "posts/r1");
    }
}
