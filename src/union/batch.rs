//! Per-transaction coalescing of document changes.

use super::{Shared, Union, UnionHooks};
use crate::error::Result;
use crate::message::{encode_update, Batch};
use crate::transaction::TransactionContext;
use crate::types::{DocChange, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

type OpenBatches = Arc<Mutex<HashMap<TransactionId, Batch>>>;

/// Turns document changes into messages for a union.
///
/// Inside a transaction, every change is appended to one batch for that
/// transaction. The batch is encoded and sent through the union's gate when
/// the transaction commits, and discarded when it aborts. Outside a
/// transaction, each change is sent on its own.
///
/// Holds the union weakly, so a registered observer does not keep it alive.
pub struct BatchUpdate<H: UnionHooks> {
    union: Weak<Shared<H>>,
    open: OpenBatches,
}

impl<H: UnionHooks> BatchUpdate<H> {
    pub(super) fn new(union: Weak<Shared<H>>) -> Self {
        Self {
            union,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle one change.
    ///
    /// Changes for which `build_update` returns `None` are ignored, as is
    /// everything once the union has been dropped.
    pub fn apply(&self, change: &DocChange, tx: &dyn TransactionContext) -> Result<()> {
        let Some(shared) = self.union.upgrade() else {
            return Ok(());
        };
        let Some(update) = shared.hooks.build_update(change) else {
            return Ok(());
        };

        let Some(tx_id) = tx.transaction_id() else {
            let msg = encode_update(&update)?;
            Union { shared }.send_encoded(&msg);
            return Ok(());
        };

        {
            let mut open = self.open.lock();
            if let Some(batch) = open.get_mut(&tx_id) {
                batch.push(update);
                return Ok(());
            }
            let mut batch = Batch::new();
            batch.push(update);
            open.insert(tx_id, batch);
        }
        trace!(tx = ?tx_id, "opened transaction batch");

        let open = Arc::clone(&self.open);
        let union = self.union.clone();
        tx.on_success(Box::new(move || {
            let Some(batch) = open.lock().remove(&tx_id) else {
                return;
            };
            let Some(shared) = union.upgrade() else {
                return;
            };
            match batch.encode() {
                Ok(msg) => Union { shared }.send_encoded(&msg),
                Err(e) => error!(tx = ?tx_id, error = %e, "failed to encode transaction batch"),
            }
        }));

        let open = Arc::clone(&self.open);
        tx.on_abort(Box::new(move || {
            if open.lock().remove(&tx_id).is_some() {
                trace!(tx = ?tx_id, "discarded transaction batch");
            }
        }));

        Ok(())
    }

    /// Number of transactions with a batch still open.
    pub fn open_transactions(&self) -> usize {
        self.open.lock().len()
    }

    /// Wrap as a change-feed callback. Failures are logged.
    pub fn into_observer(self) -> impl Fn(&DocChange, &dyn TransactionContext) + Send + Sync + 'static {
        move |change: &DocChange, tx: &dyn TransactionContext| {
            if let Err(e) = self.apply(change, tx) {
                error!(error = %e, "batch update failed");
            }
        }
    }
}

impl<H: UnionHooks> Clone for BatchUpdate<H> {
    fn clone(&self) -> Self {
        Self {
            union: self.union.clone(),
            open: Arc::clone(&self.open),
        }
    }
}

impl<H: UnionHooks> fmt::Debug for BatchUpdate<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchUpdate")
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}
