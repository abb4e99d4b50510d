//! Wire updates and their encoding.
//!
//! A message is one tag byte followed by a MessagePack body:
//!
//! - `A`, `C`, `R`: a single add / change / remove [`Update`]
//! - `W`: a batch, whose body is the ordered array of updates
//!
//! Encoded messages are reference counted so one snapshot can be handed to
//! every connection of a load group without copying.

use crate::error::{Result, UnionError};
use crate::types::{Attributes, DocChange, DocId, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Tag of a batch message.
pub const BATCH_TAG: u8 = b'W';

/// A single document update as sent to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Update {
    /// Document added; carries all attributes.
    Added {
        model: String,
        id: DocId,
        attributes: Attributes,
    },
    /// Document changed; carries the current values of the changed fields.
    Changed {
        model: String,
        id: DocId,
        fields: Attributes,
    },
    /// Document removed, with an optional reason flag.
    Removed {
        model: String,
        id: DocId,
        flag: Option<String>,
    },
}

impl Update {
    /// Default update builder for a change event.
    pub fn from_change(change: &DocChange) -> Self {
        match change {
            DocChange::Add(doc) => Update::added(doc),
            DocChange::Change { doc, undo } => {
                let fields = undo
                    .keys()
                    .map(|k| (k.clone(), doc.get(k).cloned().unwrap_or(Value::Null)))
                    .collect();
                Update::Changed {
                    model: doc.model.clone(),
                    id: doc.id.clone(),
                    fields,
                }
            }
            DocChange::Remove { doc, flag } => Update::removed(doc, flag.clone()),
        }
    }

    pub fn added(doc: &Document) -> Self {
        Update::Added {
            model: doc.model.clone(),
            id: doc.id.clone(),
            attributes: doc.attributes.clone(),
        }
    }

    pub fn changed(doc: &Document, fields: Attributes) -> Self {
        Update::Changed {
            model: doc.model.clone(),
            id: doc.id.clone(),
            fields,
        }
    }

    pub fn removed(doc: &Document, flag: Option<String>) -> Self {
        Update::Removed {
            model: doc.model.clone(),
            id: doc.id.clone(),
            flag,
        }
    }

    /// Wire tag of a single-update message.
    pub fn tag(&self) -> u8 {
        match self {
            Update::Added { .. } => b'A',
            Update::Changed { .. } => b'C',
            Update::Removed { .. } => b'R',
        }
    }

    pub fn id(&self) -> &DocId {
        match self {
            Update::Added { id, .. } | Update::Changed { id, .. } | Update::Removed { id, .. } => id,
        }
    }
}

/// An already-encoded wire message.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedMessage(Arc<[u8]>);

impl EncodedMessage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EncodedMessage(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The tag byte, if any.
    pub fn tag(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn is_batch(&self) -> bool {
        self.tag() == Some(BATCH_TAG)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn decode(&self) -> Result<Message> {
        decode_message(&self.0)
    }
}

impl fmt::Debug for EncodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag().map(char::from).unwrap_or('?');
        write!(f, "EncodedMessage({}, {} bytes)", tag, self.0.len())
    }
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Single(Update),
    Batch(Vec<Update>),
}

impl Message {
    /// All updates carried by the message, in order.
    pub fn into_updates(self) -> Vec<Update> {
        match self {
            Message::Single(update) => vec![update],
            Message::Batch(updates) => updates,
        }
    }
}

/// Encode one update as a single-update message.
pub fn encode_update(update: &Update) -> Result<EncodedMessage> {
    let mut bytes = vec![update.tag()];
    rmp_serde::encode::write(&mut bytes, update)?;
    Ok(EncodedMessage::from_bytes(bytes))
}

/// Decode a message produced by [`encode_update`] or [`Batch::encode`].
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    let (&tag, body) = bytes
        .split_first()
        .ok_or_else(|| UnionError::MalformedMessage("empty message".into()))?;

    match tag {
        BATCH_TAG => Ok(Message::Batch(rmp_serde::from_slice(body)?)),
        b'A' | b'C' | b'R' => {
            let update: Update = rmp_serde::from_slice(body)?;
            if update.tag() != tag {
                return Err(UnionError::MalformedMessage(format!(
                    "tag {} does not match {:?}",
                    char::from(tag),
                    update
                )));
            }
            Ok(Message::Single(update))
        }
        other => Err(UnionError::MalformedMessage(format!(
            "unknown tag 0x{:02x}",
            other
        ))),
    }
}

/// Accumulates updates into one batch message.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    updates: Vec<Update>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: Update) {
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// Encode the batch as a `W` message.
    pub fn encode(&self) -> Result<EncodedMessage> {
        let mut bytes = vec![BATCH_TAG];
        rmp_serde::encode::write(&mut bytes, &self.updates)?;
        Ok(EncodedMessage::from_bytes(bytes))
    }
}

/// Open a batch, let `f` fill it, and encode the result.
pub fn with_batch<F>(f: F) -> Result<EncodedMessage>
where
    F: FnOnce(&mut Batch) -> Result<()>,
{
    let mut batch = Batch::new();
    f(&mut batch)?;
    batch.encode()
}
