//! Core types carried between processes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// A stored document: a JSON object keyed by field name, identified by `_id`.
pub type Document = serde_json::Map<String, Value>;

/// Field holding a document's identity.
pub const ID_FIELD: &str = "_id";

/// Returns the `_id` of a document, if any.
pub fn document_id(doc: &Document) -> Option<&Value> {
    doc.get(ID_FIELD)
}

/// Kind of change a document went through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Event {
    Insert,
    Update,
    Remove,
}

impl Event {
    /// Compact wire code.
    pub fn code(self) -> &'static str {
        match self {
            Event::Insert => "i",
            Event::Update => "u",
            Event::Remove => "r",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Event::Insert),
            "u" => Some(Event::Update),
            "r" => Some(Event::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Insert => "insert",
            Event::Update => "update",
            Event::Remove => "remove",
        };
        f.write_str(name)
    }
}

impl From<Event> for String {
    fn from(event: Event) -> Self {
        event.code().to_string()
    }
}

impl TryFrom<String> for Event {
    type Error = String;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        Event::from_code(&code).ok_or_else(|| format!("unknown event code: {:?}", code))
    }
}

/// Identifier of one process in the fleet.
///
/// Generated once when the dispatcher starts and stamped on every envelope it
/// publishes, so the process can recognise its own echoes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn generate() -> Self {
        ProcessId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for ProcessId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// The unit published on a channel.
///
/// Keys are kept short on the wire; see [`crate::codec`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "e")]
    pub event: Event,

    /// Publishing process.
    #[serde(rename = "u")]
    pub uid: String,

    /// Full document for inserts, at least `_id` for updates and removes.
    #[serde(rename = "d", default)]
    pub doc: Document,

    /// Fields touched by an update.
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,

    /// Raw update specification (synthetic events only).
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<Value>,

    /// Top-level fields touched by the modifier (synthetic events only).
    #[serde(rename = "mt", default, skip_serializing_if = "Option::is_none")]
    pub modified_top_level_fields: Option<Vec<String>>,

    #[serde(rename = "s", default)]
    pub synthetic: bool,
}

impl Envelope {
    fn new(event: Event, doc: Document) -> Self {
        Self {
            event,
            uid: String::new(),
            doc,
            fields: None,
            modifier: None,
            modified_top_level_fields: None,
            synthetic: false,
        }
    }

    pub fn insert(doc: Document) -> Self {
        Self::new(Event::Insert, doc)
    }

    pub fn update(doc: Document, fields: Vec<String>) -> Self {
        Self {
            fields: Some(fields),
            ..Self::new(Event::Update, doc)
        }
    }

    pub fn remove(doc: Document) -> Self {
        Self::new(Event::Remove, doc)
    }

    /// A manually triggered event carrying an explicit modifier.
    ///
    /// Top-level fields are derived from the modifier's operators.
    pub fn synthetic(event: Event, doc: Document, modifier: Value) -> Self {
        let modified = modifier_top_level_fields(&modifier);
        Self {
            modifier: Some(modifier),
            modified_top_level_fields: Some(modified),
            synthetic: true,
            ..Self::new(event, doc)
        }
    }

    /// Set the originating process.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn doc_id(&self) -> Option<&Value> {
        document_id(&self.doc)
    }
}

/// Collects the top-level field names touched by an update modifier.
///
/// `{"$set": {"a.b": 1, "c": 2}, "$inc": {"d": 1}}` yields `["a", "c", "d"]`.
/// A modifier without operators is a replacement and touches its own keys.
pub fn modifier_top_level_fields(modifier: &Value) -> Vec<String> {
    let mut fields = BTreeSet::new();

    if let Value::Object(ops) = modifier {
        for (op, body) in ops {
            if op.starts_with('$') {
                if let Value::Object(paths) = body {
                    for path in paths.keys() {
                        fields.insert(top_level(path).to_string());
                    }
                }
            } else {
                fields.insert(top_level(op).to_string());
            }
        }
    }

    fields.into_iter().collect()
}

fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}
