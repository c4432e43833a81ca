//! Record ↔ document mapping.
//!
//! Encoding overlays the identity field with the record id, so the stored
//! identity never depends on content. Decoding receives a [`DecodeContext`]
//! naming the collection and carrying caller supplied side data that nested
//! fields can use to resolve their own types.

use crate::core::{
    AccessorError, Document, ID_FIELD, Result, document_id, document_uuid, id_string,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

/// A value the accessor can store.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn record_id(&self) -> Uuid;

    /// Builds the record from a document whose identity field was removed.
    ///
    /// Override to consult `context` while decoding polymorphic fields.
    fn from_document(document: Document, _context: &DecodeContext) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(document))
    }
}

/// Persistent wrapper pairing an application value with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<T> {
    pub id: Uuid,
    #[serde(default)]
    pub version: u64,
    pub item: T,
}

impl<T> Entity<T> {
    pub fn new(item: T) -> Self {
        Self::with_id(Uuid::new_v4(), item)
    }

    pub fn with_id(id: Uuid, item: T) -> Self {
        Self { id, version: 0, item }
    }
}

impl<T> Record for Entity<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn record_id(&self) -> Uuid {
        self.id
    }
}

/// Ambient information available while decoding one collection.
#[derive(Clone)]
pub struct DecodeContext {
    collection: String,
    data: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl DecodeContext {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            data: HashMap::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn with<V: Any + Send + Sync>(mut self, key: impl Into<String>, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.data.insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` when absent or of another type.
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<&V> {
        self.data.get(key)?.downcast_ref::<V>()
    }
}

impl fmt::Debug for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("DecodeContext")
            .field("collection", &self.collection)
            .field("keys", &keys)
            .finish()
    }
}

pub fn encode<R: Record>(record: &R) -> Result<Document> {
    let Value::Object(mut document) = serde_json::to_value(record)? else {
        return Err(AccessorError::Encode(format!(
            "record {} does not encode to a document",
            record.record_id()
        )));
    };
    document.insert(ID_FIELD.to_string(), Value::String(id_string(record.record_id())));
    Ok(document)
}

pub fn decode<R: Record>(mut document: Document, context: &DecodeContext) -> Result<R> {
    let id = document_id(&document).unwrap_or_default().to_string();
    let stored_id = document_uuid(&document);
    let decode_error = |reason: String| AccessorError::Decode {
        collection: context.collection().to_string(),
        id: id.clone(),
        reason,
    };

    document.remove(ID_FIELD);
    let record = R::from_document(document, context).map_err(|err| decode_error(err.to_string()))?;

    if stored_id != Some(record.record_id()) {
        return Err(decode_error(format!(
            "identity field does not match record id {}",
            record.record_id()
        )));
    }

    Ok(record)
}

/// Decodes every document, skipping and logging those that fail.
pub fn decode_all<R: Record>(documents: Vec<Document>, context: &DecodeContext) -> Vec<R> {
    let mut records = Vec::with_capacity(documents.len());
    for document in documents {
        match decode(document, context) {
            Ok(record) => records.push(record),
            Err(AccessorError::Decode {
                collection,
                id,
                reason,
            }) => {
                event!(
                    Level::ERROR,
                    collection = %collection,
                    id = %id,
                    error = %reason,
                    "skipping undecodable record"
                );
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    collection = %context.collection(),
                    error = %err,
                    "skipping undecodable record"
                );
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        int: i64,
        str: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tagged {
        id: Uuid,
        unit: String,
    }

    impl Record for Tagged {
        fn record_id(&self) -> Uuid {
            self.id
        }

        fn from_document(
            mut document: Document,
            context: &DecodeContext,
        ) -> serde_json::Result<Self> {
            if let Some(unit) = context.get::<String>("default_unit") {
                document
                    .entry("unit")
                    .or_insert_with(|| Value::String(unit.clone()));
            }
            serde_json::from_value(Value::Object(document))
        }
    }

    #[test]
    fn test_encode_overlays_identity_field() {
        let entity = Entity::new(Sample {
            int: 10,
            str: "10".into(),
        });

        let document = encode(&entity).unwrap();
        assert_eq!(document[ID_FIELD], json!(id_string(entity.id)));
        assert_eq!(document["item"], json!({"int": 10, "str": "10"}));
    }

    #[test]
    fn test_identity_does_not_depend_on_content() {
        let mut entity = Entity::new(Sample {
            int: 1,
            str: "1".into(),
        });
        let first = encode(&entity).unwrap();
        entity.item.int = 2;
        let second = encode(&entity).unwrap();

        assert_eq!(first[ID_FIELD], second[ID_FIELD]);
        assert_ne!(first["item"], second["item"]);
    }

    #[test]
    fn test_decode_restores_record() {
        let entity = Entity::new(Sample {
            int: 10,
            str: "10".into(),
        });
        let context = DecodeContext::new("samples");

        let decoded: Entity<Sample> = decode(encode(&entity).unwrap(), &context).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_decode_forwards_context() {
        let id = Uuid::new_v4();
        let mut document = Document::new();
        document.insert(ID_FIELD.into(), json!(id_string(id)));
        document.insert("id".into(), json!(id));

        let context = DecodeContext::new("tagged").with("default_unit", "kg".to_string());
        let decoded: Tagged = decode(document, &context).unwrap();
        assert_eq!(decoded.unit, "kg");
    }

    #[test]
    fn test_decode_error_names_collection_and_id() {
        let id = Uuid::new_v4();
        let mut document = Document::new();
        document.insert(ID_FIELD.into(), json!(id_string(id)));
        document.insert("id".into(), json!(id));
        document.insert("item".into(), json!({"int": "not a number", "str": "x"}));

        let err = decode::<Entity<Sample>>(document, &DecodeContext::new("samples")).unwrap_err();
        match err {
            AccessorError::Decode { collection, id: bad_id, .. } => {
                assert_eq!(collection, "samples");
                assert_eq!(bad_id, id_string(id));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_accepts_upper_case_identity() {
        let entity = Entity::new(Sample {
            int: 3,
            str: "3".into(),
        });
        let mut document = encode(&entity).unwrap();
        document.insert(ID_FIELD.into(), json!(id_string(entity.id).to_uppercase()));
        document.insert("id".into(), json!(id_string(entity.id).to_uppercase()));

        let decoded: Entity<Sample> = decode(document, &DecodeContext::new("samples")).unwrap();
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_decode_rejects_mismatched_identity() {
        let entity = Entity::new(Sample {
            int: 1,
            str: "1".into(),
        });
        let mut document = encode(&entity).unwrap();
        document.insert(ID_FIELD.into(), json!(id_string(Uuid::new_v4())));

        assert!(decode::<Entity<Sample>>(document, &DecodeContext::new("samples")).is_err());
    }

    #[test]
    fn test_decode_all_skips_failures() {
        let good = Entity::new(Sample {
            int: 1,
            str: "1".into(),
        });
        let mut bad = encode(&Entity::new(Sample {
            int: 2,
            str: "2".into(),
        }))
        .unwrap();
        bad.insert("item".into(), json!("corrupted"));

        let records: Vec<Entity<Sample>> =
            decode_all(vec![encode(&good).unwrap(), bad], &DecodeContext::new("samples"));
        assert_eq!(records, vec![good]);
    }

    #[test]
    fn test_context_typed_lookup() {
        let context = DecodeContext::new("c").with("limit", 5u32);
        assert_eq!(context.get::<u32>("limit"), Some(&5));
        assert_eq!(context.get::<String>("limit"), None);
        assert_eq!(context.get::<u32>("missing"), None);
        assert_eq!(context.collection(), "c");
    }
}
