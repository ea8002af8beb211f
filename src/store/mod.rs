//! Collection-oriented document storage.
//!
//! Handlers talk to a [`DocumentStore`]; the Firestore REST backend is used in
//! production and the in-memory backend in tests and local runs.

pub mod auth;
pub mod firestore;
pub mod memory;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use auth::ServiceAccountKey;
pub use firestore::{FirestoreAuth, FirestoreConfig, FirestoreStore};
pub use memory::MemoryStore;

pub type Fields = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Document store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed document store response: {0}")]
    Decode(String),

    #[error("Invalid document store credentials: {0}")]
    Credentials(String),

    #[error("Access token request returned {status}: {body}")]
    TokenExchange { status: u16, body: String },
}

/// A stored document and its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    /// Fields with the document id attached under `id`.
    pub fn into_map_with_id(self) -> Fields {
        let mut fields = self.fields;
        fields.insert("id".to_string(), Value::String(self.id));
        fields
    }
}

/// Equality condition on a single field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        FieldFilter {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// Blocking document store operations. Callers in async code run these on the
/// blocking pool.
pub trait DocumentStore: Send + Sync {
    /// Identifier for a document that has not been written yet.
    fn new_document_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Creates or replaces `collection/id`. Each name in `server_timestamps`
    /// is set to the store's commit time.
    fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        server_timestamps: &[&str],
    ) -> Result<(), StoreError>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents in `collection` matching every filter.
    fn query(&self, collection: &str, filters: &[FieldFilter]) -> Result<Vec<Document>, StoreError>;

    /// Creates a document under a fresh identifier and returns it.
    fn create(
        &self,
        collection: &str,
        fields: Fields,
        server_timestamps: &[&str],
    ) -> Result<String, StoreError> {
        let id = self.new_document_id();
        self.set(collection, &id, fields, server_timestamps)?;
        Ok(id)
    }
}

/// Which backend to connect at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Firestore(FirestoreConfig),
    Memory,
}

pub fn connect(backend: &StoreBackend) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match backend {
        StoreBackend::Firestore(config) => {
            log::info!("Connecting to Firestore project {}", config.project_id);
            Ok(Arc::new(FirestoreStore::new(config.clone())?))
        }
        StoreBackend::Memory => {
            log::warn!("Using the in-memory document store, data will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_is_attached_to_fields() {
        let mut fields = Fields::new();
        fields.insert("userId".into(), json!("u1"));
        let doc = Document {
            id: "abc".into(),
            fields,
        };
        let map = doc.into_map_with_id();
        assert_eq!(map["id"], "abc");
        assert_eq!(map["userId"], "u1");
    }

    #[test]
    fn create_uses_distinct_ids() {
        let store = MemoryStore::new();
        let a = store.create("c", Fields::new(), &[]).unwrap();
        let b = store.create("c", Fields::new(), &[]).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len("c"), 2);
    }
}
