//! Transaction context passed explicitly to batch updaters.
//!
//! A [`Transaction`] collects success and abort callbacks while its body
//! runs, then fires one list or the other depending on the outcome.

use crate::types::TransactionId;
use parking_lot::Mutex;
use std::mem;

/// Callback fired at the end of a transaction.
pub type TxCallback = Box<dyn FnOnce() + Send>;

/// What a batch updater needs to know about the surrounding transaction.
pub trait TransactionContext {
    /// Id of the active transaction, `None` outside of one.
    fn transaction_id(&self) -> Option<TransactionId>;

    fn is_in_transaction(&self) -> bool {
        self.transaction_id().is_some()
    }

    /// Run `f` once the transaction commits.
    fn on_success(&self, f: TxCallback);

    /// Run `f` if the transaction aborts.
    fn on_abort(&self, f: TxCallback);
}

/// Context used outside of any transaction.
///
/// Success callbacks run immediately; abort callbacks are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTransaction;

impl TransactionContext for NoTransaction {
    fn transaction_id(&self) -> Option<TransactionId> {
        None
    }

    fn on_success(&self, f: TxCallback) {
        f();
    }

    fn on_abort(&self, _f: TxCallback) {}
}

/// An in-process transaction scope.
pub struct Transaction {
    id: TransactionId,
    success: Mutex<Vec<TxCallback>>,
    abort: Mutex<Vec<TxCallback>>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: TransactionId::next(),
            success: Mutex::new(Vec::new()),
            abort: Mutex::new(Vec::new()),
        }
    }

    /// Run `body` inside a new transaction.
    ///
    /// On `Ok` the success callbacks run in registration order. On `Err` the
    /// abort callbacks run and the error is returned unchanged.
    pub fn run<T, E, F>(body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction) -> std::result::Result<T, E>,
    {
        let tx = Transaction::new();
        match body(&tx) {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    fn commit(&self) {
        self.abort.lock().clear();
        let callbacks = mem::take(&mut *self.success.lock());
        for f in callbacks {
            f();
        }
    }

    fn rollback(&self) {
        self.success.lock().clear();
        let callbacks = mem::take(&mut *self.abort.lock());
        for f in callbacks {
            f();
        }
    }
}

impl TransactionContext for Transaction {
    fn transaction_id(&self) -> Option<TransactionId> {
        Some(self.id)
    }

    fn on_success(&self, f: TxCallback) {
        self.success.lock().push(f);
    }

    fn on_abort(&self, f: TxCallback) {
        self.abort.lock().push(f);
    }
}
