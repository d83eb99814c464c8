//! In-memory [`LocalStore`].

use crate::store::{Collection, CollectionKind, Field, FieldKind, LocalStore, Record, StoreError};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;

/// Name of the built-in account registry collection.
pub const REGISTRY_COLLECTION: &str = "_superusers";

const SYSTEM_KEYS: [&str; 2] = ["created", "updated"];

/// A concurrent in-memory store with schema validation.
///
/// Starts with the built-in registry collection. Saves stamp `created` on
/// insert and `updated` on every write.
#[derive(Debug)]
pub struct MemoryStore {
    collections: DashMap<String, Collection>,
    records: DashMap<(String, String), Record>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store holding only the registry collection.
    pub fn new() -> Self {
        let store = Self {
            collections: DashMap::new(),
            records: DashMap::new(),
        };
        let registry = Collection {
            id: "pbc_superusers".to_string(),
            name: REGISTRY_COLLECTION.to_string(),
            kind: CollectionKind::Auth,
            system: true,
            fields: vec![
                Field::new("email", FieldKind::Email).required(),
                Field::new("tokenKey", FieldKind::Text),
            ],
            indexes: vec!["CREATE UNIQUE INDEX idx_email ON _superusers (email)".to_string()],
        };
        store.collections.insert(registry.name.clone(), registry);
        store
    }

    /// Number of records across all collections.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn resolve_name(&self, name_or_id: &str) -> Option<String> {
        if self.collections.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.collections
            .iter()
            .find(|c| c.id == name_or_id)
            .map(|c| c.name.clone())
    }

    fn validate(collection: &Collection, record: &Record) -> Result<(), StoreError> {
        for key in record.data.keys() {
            if SYSTEM_KEYS.contains(&key.as_str()) {
                continue;
            }
            if collection.field(key).is_none() {
                return Err(StoreError::Validation {
                    msg: format!("unknown field {} in collection {}", key, collection.name),
                });
            }
        }
        for field in collection.fields.iter().filter(|f| f.required && !f.system) {
            match record.data.get(&field.name) {
                None | Some(Value::Null) => {
                    return Err(StoreError::Validation {
                        msg: format!("field {} is required", field.name),
                    })
                }
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(StoreError::Validation {
                        msg: format!("field {} is required", field.name),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn find_collection(&self, name_or_id: &str) -> Result<Collection, StoreError> {
        let name = self
            .resolve_name(name_or_id)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", name_or_id)))?;
        self.collections
            .get(&name)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::not_found(format!("collection {}", name_or_id)))
    }

    fn save_collection(&self, collection: Collection) -> Result<(), StoreError> {
        if collection.name.is_empty() {
            return Err(StoreError::Validation {
                msg: "collection name is empty".to_string(),
            });
        }
        let renamed_from = self
            .collections
            .iter()
            .find(|c| c.id == collection.id && c.name != collection.name)
            .map(|c| c.name.clone());
        if let Some(old) = renamed_from {
            self.collections.remove(&old);
            let moved: Vec<Record> = self
                .records
                .iter()
                .filter(|r| r.key().0 == old)
                .map(|r| r.value().clone())
                .collect();
            self.records.retain(|(col, _), _| *col != old);
            for mut record in moved {
                record.collection = collection.name.clone();
                self.records
                    .insert((collection.name.clone(), record.id.clone()), record);
            }
        }
        self.collections.insert(collection.name.clone(), collection);
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        let name = self
            .resolve_name(name)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", name)))?;
        self.collections.remove(&name);
        self.records.retain(|(col, _), _| *col != name);
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let mut all: Vec<Collection> = self.collections.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    fn find_record(&self, collection: &str, id: &str) -> Result<Record, StoreError> {
        let name = self
            .resolve_name(collection)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", collection)))?;
        self.records
            .get(&(name, id.to_string()))
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found(format!("record {}/{}", collection, id)))
    }

    fn find_record_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Record, StoreError> {
        let name = self
            .resolve_name(collection)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", collection)))?;
        self.records
            .iter()
            .find(|r| r.key().0 == name && r.data.get(field) == Some(value))
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                StoreError::not_found(format!("record {} where {} = {}", collection, field, value))
            })
    }

    fn save_record(&self, mut record: Record) -> Result<Record, StoreError> {
        if record.id.is_empty() {
            return Err(StoreError::Validation {
                msg: "record id is empty".to_string(),
            });
        }
        let collection = self.find_collection(&record.collection)?;
        Self::validate(&collection, &record)?;
        record.collection = collection.name.clone();

        let key = (collection.name.clone(), record.id.clone());
        let now = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let created = self
            .records
            .get(&key)
            .and_then(|existing| existing.data.get("created").cloned())
            .unwrap_or_else(|| now.clone());
        record.data.insert("created".to_string(), created);
        record.data.insert("updated".to_string(), now);
        self.records.insert(key, record.clone());
        Ok(record)
    }

    fn delete_record(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let name = self
            .resolve_name(collection)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", collection)))?;
        self.records
            .remove(&(name, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("record {}/{}", collection, id)))
    }

    fn list_records(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        let name = self
            .resolve_name(collection)
            .ok_or_else(|| StoreError::not_found(format!("collection {}", collection)))?;
        let mut all: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.key().0 == name)
            .map(|r| r.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts() -> Collection {
        Collection::new("posts")
            .with_field(Field::new("title", FieldKind::Text).required())
            .with_field(Field::new("views", FieldKind::Number))
    }

    fn post(id: &str, title: &str) -> Record {
        let mut r = Record::new("posts", id);
        r.set("title", json!(title));
        r
    }

    #[test]
    fn test_registry_bootstrapped() {
        let store = MemoryStore::new();
        let registry = store.find_collection(REGISTRY_COLLECTION).unwrap();
        assert_eq!(registry.kind, CollectionKind::Auth);
        assert!(store.find_collection("pbc_superusers").is_ok());
    }

    #[test]
    fn test_save_insert_then_update_keeps_created() {
        let store = MemoryStore::new();
        store.save_collection(posts()).unwrap();
        let first = store.save_record(post("r1", "a")).unwrap();
        let second = store.save_record(post("r1", "b")).unwrap();
        assert_eq!(first.data["created"], second.data["created"]);
        assert_eq!(store.find_record("posts", "r1").unwrap().data["title"], "b");
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn test_validation() {
        let store = MemoryStore::new();
        store.save_collection(posts()).unwrap();

        let missing = Record::new("posts", "r1");
        assert!(matches!(
            store.save_record(missing),
            Err(StoreError::Validation { .. })
        ));

        let mut unknown = post("r2", "x");
        unknown.set("nope", json!(1));
        assert!(matches!(
            store.save_record(unknown),
            Err(StoreError::Validation { .. })
        ));

        let err = store.save_record(Record::new("ghost", "r1")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let store = MemoryStore::new();
        store.save_collection(posts()).unwrap();
        assert!(store.find_record("posts", "nope").unwrap_err().is_not_found());
        assert!(store.delete_record("posts", "nope").unwrap_err().is_not_found());
        assert!(store.find_collection("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_find_by_field() {
        let store = MemoryStore::new();
        store.save_collection(posts()).unwrap();
        store.save_record(post("r1", "hello")).unwrap();
        let found = store
            .find_record_by_field("posts", "title", &json!("hello"))
            .unwrap();
        assert_eq!(found.id, "r1");
        assert!(store
            .find_record_by_field("posts", "title", &json!("other"))
            .is_err());
    }

    #[test]
    fn test_delete_collection_drops_records() {
        let store = MemoryStore::new();
        store.save_collection(posts()).unwrap();
        store.save_record(post("r1", "a")).unwrap();
        store.delete_collection("posts").unwrap();
        assert_eq!(store.record_count(), 0);
        assert!(store.delete_collection("posts").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_moves_records() {
        let store = MemoryStore::new();
        let col = posts();
        store.save_collection(col.clone()).unwrap();
        store.save_record(post("r1", "a")).unwrap();

        let mut renamed = col;
        renamed.name = "articles".to_string();
        store.save_collection(renamed).unwrap();

        assert!(store.find_collection("posts").is_err());
        let moved = store.find_record("articles", "r1").unwrap();
        assert_eq!(moved.collection, "articles");
    }
}
