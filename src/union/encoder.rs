//! Encoder handed to load hooks.

use crate::error::Result;
use crate::message::{Batch, EncodedMessage, Update};
use crate::types::{Attributes, Document};

/// Collects the documents a load pass produces.
///
/// Every call appends one update; the pass encodes them all into a single
/// batch message shared by the whole load group.
#[derive(Debug, Default)]
pub struct LoadEncoder {
    batch: Batch,
}

impl LoadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `doc` to the group as an add.
    pub fn add_doc(&mut self, doc: &Document) {
        self.batch.push(Update::added(doc));
    }

    /// Send the named fields of `doc` as a change.
    pub fn chg_doc(&mut self, doc: &Document, fields: Attributes) {
        self.batch.push(Update::changed(doc, fields));
    }

    /// Remove `doc` from the group; `flag` reaches the client unchanged.
    pub fn rem_doc(&mut self, doc: &Document, flag: Option<&str>) {
        self.batch.push(Update::removed(doc, flag.map(str::to_owned)));
    }

    /// Append a prebuilt update.
    pub fn push(&mut self, update: Update) {
        self.batch.push(update);
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Encode what was collected; `None` when nothing was.
    pub(crate) fn finish(self) -> Result<Option<EncodedMessage>> {
        if self.batch.is_empty() {
            return Ok(None);
        }
        self.batch.encode().map(Some)
    }
}
