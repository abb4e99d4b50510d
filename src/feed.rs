//! Change-notification source and observer handles.

use crate::transaction::TransactionContext;
use crate::types::DocChange;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Something started by `init_observers` that must be stopped on empty.
pub trait ObserverHandle: Send {
    fn stop(self: Box<Self>);
}

/// Callback invoked for each document mutation.
pub type ChangeCallback = Arc<dyn Fn(&DocChange, &dyn TransactionContext) + Send + Sync>;

type Observers = RwLock<BTreeMap<u64, ChangeCallback>>;

/// Fans document changes out to registered observers.
pub struct ChangeFeed {
    observers: Arc<Observers>,
    next_id: AtomicU64,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for every subsequent change.
    pub fn on_change<F>(&self, callback: F) -> ChangeFeedHandle
    where
        F: Fn(&DocChange, &dyn TransactionContext) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers.write().insert(id, Arc::new(callback));
        ChangeFeedHandle {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Report one change to every observer, in registration order.
    pub fn notify(&self, change: &DocChange, tx: &dyn TransactionContext) {
        // Snapshot so observers may (un)register while being called.
        let observers: Vec<ChangeCallback> = self.observers.read().values().cloned().collect();
        for observer in observers {
            observer(change, tx);
        }
    }

    /// Get observer count.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration returned by [`ChangeFeed::on_change`].
pub struct ChangeFeedHandle {
    id: u64,
    observers: Weak<Observers>,
}

impl ChangeFeedHandle {
    /// Unregister the callback.
    pub fn stop(self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.write().remove(&self.id);
        }
    }
}

impl ObserverHandle for ChangeFeedHandle {
    fn stop(self: Box<Self>) {
        ChangeFeedHandle::stop(*self)
    }
}
