//! Subscriber contract and field-interest aggregation.

use crate::error::SubscriberError;
use crate::storage::Collection;
use crate::types::{Document, Event};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Document fields a subscriber needs to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldInterest {
    /// Every field; no projection possible.
    All,
    /// Only these paths. An empty set contributes nothing to a union.
    Only(BTreeSet<String>),
}

impl FieldInterest {
    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldInterest::Only(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FieldInterest::All)
    }

    /// Union of two interests; `All` absorbs everything.
    pub fn union(self, other: FieldInterest) -> FieldInterest {
        match (self, other) {
            (FieldInterest::All, _) | (_, FieldInterest::All) => FieldInterest::All,
            (FieldInterest::Only(mut a), FieldInterest::Only(b)) => {
                a.extend(b);
                FieldInterest::Only(a)
            }
        }
    }

    /// Union of any number of interests. Short-circuits on `All`.
    pub fn union_all<I>(interests: I) -> FieldInterest
    where
        I: IntoIterator<Item = FieldInterest>,
    {
        let mut fields = BTreeSet::new();
        for interest in interests {
            match interest {
                FieldInterest::All => return FieldInterest::All,
                FieldInterest::Only(only) => fields.extend(only),
            }
        }
        FieldInterest::Only(fields)
    }
}

/// One active interest registration.
///
/// Owned by the calling layer; the dispatcher only keeps a shared handle while
/// attached and never mutates it. Identity (the `Arc` pointer), not value,
/// distinguishes subscribers.
pub trait Subscriber: Send + Sync {
    /// Channels this subscriber listens on. Must not change while attached.
    fn channels(&self) -> &[String];

    /// Collection used to re-fetch documents for this subscriber's events.
    fn collection(&self) -> Arc<dyn Collection>;

    fn fields_of_interest(&self) -> FieldInterest {
        FieldInterest::All
    }

    /// Apply a storage-originated change.
    ///
    /// `doc` is the authoritative document (or the removed document for
    /// [`Event::Remove`]); `fields` are the fields the change touched.
    fn process(
        &self,
        event: Event,
        doc: &Document,
        fields: Option<&[String]>,
    ) -> Result<(), SubscriberError>;

    /// Apply a manually triggered change exactly as described by `modifier`.
    fn process_synthetic(
        &self,
        event: Event,
        doc: &Document,
        modifier: Option<&Value>,
        modified_top_level_fields: Option<&[String]>,
    ) -> Result<(), SubscriberError>;
}

/// Field interest of a channel's subscribers taken together.
pub fn fields_of_interest_from_all(subscribers: &[Arc<dyn Subscriber>]) -> FieldInterest {
    FieldInterest::union_all(subscribers.iter().map(|s| s.fields_of_interest()))
}

/// Whether two handles point at the same subscriber.
pub fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}
