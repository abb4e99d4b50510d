//! Core types shared by unions, encoders and collaborators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Field name to value map of a document.
pub type Attributes = Map<String, Value>;

/// Milliseconds since Unix epoch. Zero means "never".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The "never subscribed" timestamp.
    pub const NEVER: Timestamp = Timestamp(0);

    /// Current time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Round down to a multiple of `interval`.
    pub fn floor_to(self, interval: Duration) -> Self {
        let step = interval.as_millis() as i64;
        if step <= 0 {
            return self;
        }
        Timestamp(self.0.div_euclid(step) * step)
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_millis() as i64))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identifier of one client subscription.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a document within its model.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document as seen by the union: model name, identity and attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub model: String,
    pub id: DocId,
    pub attributes: Attributes,
}

impl Document {
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: DocId::new(id),
            attributes: Attributes::new(),
        }
    }

    /// Set an attribute.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }
}

/// One document mutation reported by the change-notification source.
#[derive(Clone, Debug, PartialEq)]
pub enum DocChange {
    /// A new document.
    Add(Document),

    /// An existing document changed. `undo` holds the previous values of the
    /// changed fields; `doc` holds the current document.
    Change { doc: Document, undo: Attributes },

    /// A document was removed. `flag` is an opaque reason passed to clients.
    Remove { doc: Document, flag: Option<String> },
}

impl DocChange {
    pub fn add(doc: Document) -> Self {
        DocChange::Add(doc)
    }

    pub fn change(doc: Document, undo: Attributes) -> Self {
        DocChange::Change { doc, undo }
    }

    pub fn remove(doc: Document) -> Self {
        DocChange::Remove { doc, flag: None }
    }

    pub fn remove_with_flag(doc: Document, flag: impl Into<String>) -> Self {
        DocChange::Remove {
            doc,
            flag: Some(flag.into()),
        }
    }

    pub fn doc(&self) -> &Document {
        match self {
            DocChange::Add(doc) => doc,
            DocChange::Change { doc, .. } => doc,
            DocChange::Remove { doc, .. } => doc,
        }
    }

    pub fn model(&self) -> &str {
        &self.doc().model
    }

    pub fn is_add(&self) -> bool {
        matches!(self, DocChange::Add(_))
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, DocChange::Remove { .. })
    }
}

/// Identifier of one transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TransactionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tx({})", self.0)
    }
}
