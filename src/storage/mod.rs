//! Storage collaborator used to resolve authoritative documents.
//!
//! The dispatcher never writes; it only re-reads a document by id, optionally
//! restricted to the fields its subscribers care about.

mod memory;

pub use memory::MemoryCollection;

use crate::error::Result;
use crate::types::Document;
use serde_json::Value;
use std::collections::BTreeSet;

/// A document collection as seen by the dispatcher.
pub trait Collection: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Whether documents must be re-fetched at dispatch time instead of
    /// trusting the snapshot carried by the event.
    fn protect_against_race_conditions(&self) -> bool {
        true
    }

    /// Fetch one document by `_id`.
    ///
    /// With `fields`, only those paths (plus `_id`) are returned.
    fn find_one(&self, id: &Value, fields: Option<&BTreeSet<String>>) -> Result<Option<Document>>;
}

/// Copy of `doc` restricted to `_id` and the given top-level or dotted paths.
pub fn project(doc: &Document, fields: &BTreeSet<String>) -> Document {
    let mut out = Document::new();

    if let Some(id) = doc.get(crate::types::ID_FIELD) {
        out.insert(crate::types::ID_FIELD.to_string(), id.clone());
    }

    for path in fields {
        let segments: Vec<&str> = path.split('.').collect();
        copy_path(doc, &mut out, &segments);
    }

    out
}

fn copy_path(src: &Document, dst: &mut Document, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*head) else {
        return;
    };

    match (rest.is_empty(), value) {
        (true, _) => {
            dst.insert(head.to_string(), value.clone());
        }
        (false, Value::Object(child)) => {
            let slot = dst
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if let Value::Object(child_dst) = slot {
                copy_path(child, child_dst, rest);
            }
        }
        // Path descends into a scalar: nothing to copy.
        (false, _) => {}
    }
}
