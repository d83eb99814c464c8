//! The local store API consumed by replication.
//!
//! The record/collection storage engine lives outside this crate. Replication
//! only needs the narrow find/save/delete surface described by [`LocalStore`];
//! [`crate::memory_store::MemoryStore`] is the in-process implementation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const RECORD_ID_LEN: usize = 15;

/// Errors returned by a [`LocalStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The collection or record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The save was rejected by schema validation.
    #[error("validation failed: {msg}")]
    Validation {
        /// Error message describing the issue.
        msg: String,
    },

    /// Storage backend failure.
    #[error("store backend error: {msg}")]
    Backend {
        /// Error message describing the issue.
        msg: String,
    },
}

impl StoreError {
    /// Not-found is distinguishable from other failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }
}

/// Collection flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Plain records.
    #[default]
    Base,
    /// Records that can authenticate.
    Auth,
    /// Read-only projection.
    View,
}

/// Field type and its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text.
    Text,
    /// Number.
    Number,
    /// Boolean.
    Bool,
    /// E-mail address.
    Email,
    /// Date/time string.
    Date,
    /// Arbitrary JSON.
    Json,
    /// Reference(s) to records of another collection.
    Relation {
        /// Referenced collection (ID or name).
        #[serde(rename = "collectionId")]
        collection_id: String,
        /// Maximum number of references; `None` or 1 means a single ID.
        #[serde(rename = "maxSelect", default, skip_serializing_if = "Option::is_none")]
        max_select: Option<u32>,
    },
}

/// A collection field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name; also the record data key.
    pub name: String,
    /// Type and options.
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Must be present and non-null on save.
    #[serde(default)]
    pub required: bool,
    /// Managed by the storage engine.
    #[serde(default)]
    pub system: bool,
}

impl Field {
    /// A field of the given kind.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            system: false,
        }
    }

    /// Mark the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Referenced collection if this is a relation field.
    pub fn relation_target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Relation { collection_id, .. } => Some(collection_id),
            _ => None,
        }
    }
}

/// A collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Stable ID.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Flavour.
    #[serde(default, rename = "type")]
    pub kind: CollectionKind,
    /// Built-in collection.
    #[serde(default)]
    pub system: bool,
    /// Field definitions.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Index definitions.
    #[serde(default)]
    pub indexes: Vec<String>,
}

impl Collection {
    /// A base collection with a fresh ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("col_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            kind: CollectionKind::Base,
            system: false,
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a field.
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record ID, unique within its collection.
    pub id: String,
    /// Owning collection name.
    pub collection: String,
    /// Field values.
    pub data: Map<String, Value>,
}

impl Record {
    /// A new record with the given ID.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            data: Map::new(),
        }
    }

    /// A new record with a random 15-character `[a-z0-9]` ID.
    pub fn with_random_id(collection: impl Into<String>) -> Self {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let id: String = (0..RECORD_ID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self::new(collection, id)
    }

    /// Set a field value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Get a field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// The find/save/delete surface of a local storage engine.
///
/// Implementations must be safe to call from multiple tasks; replication never
/// holds one of its own locks while calling into the store.
pub trait LocalStore: Send + Sync {
    /// Find a collection by name or ID.
    fn find_collection(&self, name_or_id: &str) -> Result<Collection, StoreError>;

    /// Insert or replace a collection (matched by ID, then by name).
    fn save_collection(&self, collection: Collection) -> Result<(), StoreError>;

    /// Delete a collection and its records.
    fn delete_collection(&self, name: &str) -> Result<(), StoreError>;

    /// All collections.
    fn list_collections(&self) -> Result<Vec<Collection>, StoreError>;

    /// Find a record by ID.
    fn find_record(&self, collection: &str, id: &str) -> Result<Record, StoreError>;

    /// Find the first record whose `field` equals `value`.
    fn find_record_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Record, StoreError>;

    /// Insert or update a record. Returns the stored version.
    fn save_record(&self, record: Record) -> Result<Record, StoreError>;

    /// Delete a record.
    fn delete_record(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// All records of a collection.
    fn list_records(&self, collection: &str) -> Result<Vec<Record>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_schema_shape() {
        let col = Collection::new("comments")
            .with_field(Field::new("body", FieldKind::Text).required())
            .with_field(Field::new(
                "post",
                FieldKind::Relation {
                    collection_id: "posts".to_string(),
                    max_select: Some(1),
                },
            ));
        let value = serde_json::to_value(&col).unwrap();
        assert_eq!(value["type"], "base");
        assert_eq!(value["fields"][0]["type"], "text");
        assert_eq!(value["fields"][0]["required"], true);
        assert_eq!(value["fields"][1]["type"], "relation");
        assert_eq!(value["fields"][1]["collectionId"], "posts");

        let back: Collection = serde_json::from_value(value).unwrap();
        assert_eq!(back, col);
    }

    #[test]
    fn test_schema_defaults() {
        let col: Collection = serde_json::from_value(json!({
            "id": "c1",
            "name": "posts",
            "fields": [{"name": "title", "type": "text"}]
        }))
        .unwrap();
        assert_eq!(col.kind, CollectionKind::Base);
        assert!(!col.fields[0].required);
        assert!(col.indexes.is_empty());
    }

    #[test]
    fn test_relation_target() {
        let f = Field::new(
            "author",
            FieldKind::Relation {
                collection_id: "users".to_string(),
                max_select: None,
            },
        );
        assert_eq!(f.relation_target(), Some("users"));
        assert_eq!(Field::new("t", FieldKind::Text).relation_target(), None);
    }

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::not_found("posts/r1").is_not_found());
        assert!(!StoreError::Validation { msg: "x".into() }.is_not_found());
    }

    #[test]
    fn test_random_record_ids_differ() {
        let a = Record::with_random_id("posts");
        let b = Record::with_random_id("posts");
        assert_eq!(a.id.len(), 15);
        assert!(a.id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(a.id, b.id);
    }
}
