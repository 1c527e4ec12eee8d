//! In-process collection.

use super::{project, Collection};
use crate::error::{DispatchError, Result};
use crate::types::{document_id, Document};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A collection held in memory, keyed by `_id`.
///
/// Counts every `find_one` so callers can observe how often the dispatcher
/// went back to storage.
pub struct MemoryCollection {
    name: String,
    docs: RwLock<BTreeMap<String, Document>>,
    protect: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryCollection {
    /// Create an empty collection with race-condition protection enabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            protect: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Create an empty collection that trusts event snapshots.
    pub fn without_race_protection(name: impl Into<String>) -> Self {
        let collection = Self::new(name);
        collection.protect.store(false, Ordering::SeqCst);
        collection
    }

    pub fn set_protect_against_race_conditions(&self, protect: bool) {
        self.protect.store(protect, Ordering::SeqCst);
    }

    /// Insert or replace a document.
    pub fn insert(&self, doc: Document) -> Result<()> {
        let key = key_of(document_id(&doc).ok_or(DispatchError::MissingDocumentId)?);
        self.docs.write().insert(key, doc);
        Ok(())
    }

    /// Merge top-level fields into an existing document.
    ///
    /// Returns false if the document doesn't exist.
    pub fn update(&self, id: &Value, fields: Document) -> bool {
        let mut docs = self.docs.write();
        match docs.get_mut(&key_of(id)) {
            Some(doc) => {
                for (field, value) in fields {
                    doc.insert(field, value);
                }
                true
            }
            None => false,
        }
    }

    /// Delete a document, returning it if it was present.
    pub fn remove(&self, id: &Value) -> Option<Document> {
        self.docs.write().remove(&key_of(id))
    }

    /// Read without counting as a fetch.
    pub fn get(&self, id: &Value) -> Option<Document> {
        self.docs.read().get(&key_of(id)).cloned()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Number of `find_one` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn protect_against_race_conditions(&self) -> bool {
        self.protect.load(Ordering::SeqCst)
    }

    fn find_one(&self, id: &Value, fields: Option<&BTreeSet<String>>) -> Result<Option<Document>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let docs = self.docs.read();
        let found = docs.get(&key_of(id)).map(|doc| match fields {
            Some(fields) => project(doc, fields),
            None => doc.clone(),
        });
        Ok(found)
    }
}

/// `"42"` and `42` are different ids.
fn key_of(id: &Value) -> String {
    id.to_string()
}
