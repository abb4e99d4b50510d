//! The union: subscribers that share one snapshot computation.
//!
//! A [`Union`] is built from a [`UnionHooks`] implementation that knows how
//! to load the document set. Subscribers are admitted with
//! [`Union::add_sub`] (partitioned by `last_subscribed` time bucket) or
//! [`Union::add_sub_by_token`] (partitioned by token equality). Admission
//! blocks until the subscriber's snapshot has been sent to its connection.
//!
//! Only one load pass runs per union at a time. Live updates sent with
//! [`Union::send_encoded`] while a pass runs are held back and flushed, in
//! order, once the union is idle again.
//!
//! # Locking
//!
//! Membership transitions are serialised by a lifecycle lock, so
//! `init_observers` and `on_empty` never interleave. All other state sits
//! behind one state lock, and every send to a connection happens under it.
//! Hooks are never called with the state lock held, but `init_observers` and
//! `on_empty` run under the lifecycle lock and must not admit or remove
//! subscribers of the same union.

mod batch;
mod encoder;
mod load_queue;

pub use batch::BatchUpdate;
pub use encoder::LoadEncoder;
pub use load_queue::{LoadStatus, PartitionKey};

use crate::config::UnionConfig;
use crate::error::{Result, UnionError};
use crate::feed::ObserverHandle;
use crate::message::{encode_update, EncodedMessage, Update};
use crate::partition::{MemberList, MembershipHandle};
use crate::subscriber::Subscriber;
use crate::types::{DocChange, SubscriberId, Timestamp};
use load_queue::{Admission, Admit, LoadCoordinator, Pass, PassResult, Signal, Waiter};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// What a concrete union supplies.
///
/// Every method has a default, so an implementation only overrides what it
/// needs. Hooks run on the thread of an admitting subscriber.
pub trait UnionHooks: Send + Sync + Sized + 'static {
    /// Partition key for [`Union::add_sub_by_token`].
    type Token: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static;

    /// Called when the first subscriber arrives.
    ///
    /// Typical implementations register [`Union::batch_update`] with a change
    /// feed and keep the returned handle with [`Union::push_handle`].
    fn init_observers(&self, _union: &Union<Self>) {}

    /// Called when the last subscriber leaves, before the union stops the
    /// handles collected by [`Union::push_handle`].
    fn on_empty(&self, _union: &Union<Self>) {}

    /// Load the documents for a time partition.
    ///
    /// `min_last_subscribed` is the oldest `last_subscribed` of the group;
    /// [`Timestamp::NEVER`] asks for everything.
    fn load_initial(&self, _encoder: &mut LoadEncoder, _min_last_subscribed: Timestamp) -> Result<()> {
        Ok(())
    }

    /// Load the documents for a token partition.
    fn load_by_token(&self, _encoder: &mut LoadEncoder, _token: &Self::Token) -> Result<()> {
        Ok(())
    }

    /// Turn a change into a wire update; `None` hides the change.
    fn build_update(&self, change: &DocChange) -> Option<Update> {
        Some(Update::from_change(change))
    }
}

struct UnionState<T> {
    members: MemberList<Subscriber>,
    index: HashMap<SubscriberId, MembershipHandle>,
    coordinator: LoadCoordinator<T>,
}

impl<T> UnionState<T> {
    fn broadcast(&self, msg: &EncodedMessage) {
        for sub in &self.members {
            sub.send_encoded(msg);
        }
    }
}

struct Shared<H: UnionHooks> {
    hooks: H,
    config: UnionConfig,
    lifecycle: Mutex<()>,
    state: Mutex<UnionState<H::Token>>,
    handles: Mutex<Vec<Box<dyn ObserverHandle>>>,
    batch_update: BatchUpdate<H>,
}

/// A group of subscribers sharing snapshot loads and live updates.
///
/// Cheap to clone; clones share state.
pub struct Union<H: UnionHooks> {
    shared: Arc<Shared<H>>,
}

impl<H: UnionHooks> Union<H> {
    /// Create a union with the default configuration.
    pub fn new(hooks: H) -> Self {
        Self::with_config(hooks, UnionConfig::default())
    }

    pub fn with_config(hooks: H, config: UnionConfig) -> Self {
        let coordinator = LoadCoordinator::new(config.clone());
        let shared = Arc::new_cyclic(|weak| Shared {
            hooks,
            config,
            lifecycle: Mutex::new(()),
            state: Mutex::new(UnionState {
                members: MemberList::new(),
                index: HashMap::new(),
                coordinator,
            }),
            handles: Mutex::new(Vec::new()),
            batch_update: BatchUpdate::new(weak.clone()),
        });
        Self { shared }
    }

    pub fn hooks(&self) -> &H {
        &self.shared.hooks
    }

    pub fn config(&self) -> &UnionConfig {
        &self.shared.config
    }

    /// Admit `sub`, partitioned by its own `last_subscribed`.
    pub fn add_sub(&self, sub: &Subscriber) -> Result<()> {
        self.add_sub_at(sub, sub.last_subscribed)
    }

    /// Admit `sub`, partitioned by `last_subscribed`.
    ///
    /// Blocks until the snapshot of the subscriber's pass has been delivered.
    /// If this call ran the pass and the load failed, the error is returned
    /// here; other members of that pass are released without it.
    pub fn add_sub_at(&self, sub: &Subscriber, last_subscribed: Timestamp) -> Result<()> {
        self.shared
            .config
            .check_last_subscribed(last_subscribed, Timestamp::now())?;
        self.admit(sub, Admit::Time(last_subscribed))
    }

    /// Admit `sub`, partitioned by `token`.
    pub fn add_sub_by_token(&self, sub: &Subscriber, token: H::Token) -> Result<()> {
        self.admit(sub, Admit::Token(token))
    }

    fn admit(&self, sub: &Subscriber, admit: Admit<H::Token>) -> Result<()> {
        let admission = {
            let _lifecycle = self.shared.lifecycle.lock();

            let was_empty = {
                let state = self.shared.state.lock();
                if let Some(&handle) = state.index.get(&sub.id) {
                    let same_connection = state
                        .members
                        .get(handle)
                        .is_some_and(|member| Arc::ptr_eq(member.connection(), sub.connection()));
                    if !same_connection {
                        warn!(sub = %sub.id, "id already admitted on another connection, ignoring");
                    }
                    return Ok(());
                }
                state.members.is_empty()
            };
            if was_empty {
                debug!(sub = %sub.id, "first subscriber, starting observers");
                self.shared.hooks.init_observers(self);
            }

            let mut state = self.shared.state.lock();
            let handle = state.members.push(sub.clone());
            state.index.insert(sub.id.clone(), handle);
            state.coordinator.admit(sub.clone(), admit)
        };

        match admission {
            Admission::Lead(pass) => self.run_pass(pass),
            Admission::Wait(signal) => self.wait(signal),
        }
    }

    fn wait(&self, signal: Receiver<Signal<H::Token>>) -> Result<()> {
        match signal.recv() {
            Ok(Signal::Done(result)) => {
                trace!(?result, "released from load pass");
                Ok(())
            }
            Ok(Signal::Lead(pass)) => self.run_pass(pass),
            Err(_) => Err(UnionError::PassAbandoned),
        }
    }

    /// Run the load hook for `pass` and deliver the result.
    fn run_pass(&self, pass: Pass<H::Token>) -> Result<()> {
        debug!(pass = pass.number, key = ?pass.key, "load pass started");
        let mut guard = PassGuard {
            union: self,
            number: pass.number,
            armed: true,
        };

        let mut encoder = LoadEncoder::new();
        let loaded = match &pass.key {
            PartitionKey::Time {
                min_last_subscribed,
                ..
            } => self.shared.hooks.load_initial(&mut encoder, *min_last_subscribed),
            PartitionKey::Token(token) => self.shared.hooks.load_by_token(&mut encoder, token),
        };
        let snapshot = loaded.and_then(|()| encoder.finish());
        guard.armed = false;

        match snapshot {
            Ok(msg) => {
                self.finish_pass(pass.number, Some(msg));
                Ok(())
            }
            Err(e) => {
                warn!(pass = pass.number, error = %e, "load pass failed");
                self.finish_pass(pass.number, None);
                Err(e)
            }
        }
    }

    /// Complete the loading pass. `None` abandons it.
    fn finish_pass(&self, number: u64, snapshot: Option<Option<EncodedMessage>>) {
        let result = if snapshot.is_some() {
            PassResult::Delivered
        } else {
            PassResult::Abandoned
        };

        let done = {
            let mut state = self.shared.state.lock();
            let done = state.coordinator.complete();

            if let Some(Some(msg)) = &snapshot {
                for waiter in &done.finished {
                    waiter.subscriber.send_encoded(msg);
                }
            }
            if !done.flush.is_empty() {
                trace!(count = done.flush.len(), "flushing held messages");
                for msg in &done.flush {
                    state.broadcast(msg);
                }
            }
            done
        };

        debug!(
            pass = number,
            members = done.finished.len(),
            ?result,
            "load pass finished"
        );

        for signal in done.finished.into_iter().flat_map(Waiter::into_signals) {
            let _ = signal.send(Signal::Done(result));
        }

        let Some(next) = done.next else {
            return;
        };
        debug!(
            pass = next.pass.number,
            key = ?next.pass.key,
            leader = %next.leader.id,
            "promoted waiting group"
        );
        if let Err(unsent) = next.signal.send(Signal::Lead(next.pass)) {
            // The leader stopped waiting; run its pass on a fresh thread.
            if let Signal::Lead(pass) = unsent.into_inner() {
                let union = self.clone();
                thread::spawn(move || {
                    let _ = union.run_pass(pass);
                });
            }
        }
    }

    /// Remove `sub`. Removing a non-member is a no-op.
    ///
    /// A pass the subscriber already joined still completes and still sends
    /// to its connection.
    pub fn remove_sub(&self, sub: &Subscriber) {
        let _lifecycle = self.shared.lifecycle.lock();

        let removed = {
            let mut state = self.shared.state.lock();
            let Some(handle) = state.index.remove(&sub.id) else {
                return;
            };
            state.members.remove(handle)
        };

        if removed.is_some_and(|r| r.became_empty) {
            debug!(sub = %sub.id, "last subscriber left");
            self.shared.hooks.on_empty(self);
            self.stop_handles();
        }
    }

    fn stop_handles(&self) {
        let handles = mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            handle.stop();
        }
    }

    /// Keep a handle to stop when the union becomes empty.
    pub fn push_handle(&self, handle: Box<dyn ObserverHandle>) {
        self.shared.handles.lock().push(handle);
    }

    pub fn handle_count(&self) -> usize {
        self.shared.handles.lock().len()
    }

    pub fn has_sub(&self, sub: &Subscriber) -> bool {
        self.shared.state.lock().index.contains_key(&sub.id)
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.shared.state.lock().members.len()
    }

    /// Members in the order they were admitted.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.shared.state.lock().members.iter().cloned().collect()
    }

    /// Send `msg` to every member, or hold it until no pass is loading.
    pub fn send_encoded(&self, msg: &EncodedMessage) {
        let mut state = self.shared.state.lock();
        if state.coordinator.is_loading() {
            trace!(?msg, "holding message during load");
            state.coordinator.queue_message(msg.clone());
        } else {
            state.broadcast(msg);
        }
    }

    /// Send `msg` to every member right away, even during a load.
    pub fn send_encoded_now(&self, msg: &EncodedMessage) {
        self.shared.state.lock().broadcast(msg);
    }

    /// Build and encode the update for `change`.
    pub fn encode_update(&self, change: &DocChange) -> Result<Option<EncodedMessage>> {
        self.shared
            .hooks
            .build_update(change)
            .map(|update| encode_update(&update))
            .transpose()
    }

    /// The union's batch updater, shared by all of its clones.
    pub fn batch_update(&self) -> BatchUpdate<H> {
        self.shared.batch_update.clone()
    }

    /// A new batch updater with its own open transactions.
    pub fn build_batch_update(&self) -> BatchUpdate<H> {
        BatchUpdate::new(Arc::downgrade(&self.shared))
    }

    pub fn load_status(&self) -> LoadStatus<H::Token> {
        self.shared.state.lock().coordinator.status()
    }
}

impl<H: UnionHooks> Clone for Union<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: UnionHooks> fmt::Debug for Union<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Union")
            .field("count", &self.count())
            .field("status", &self.load_status())
            .finish()
    }
}

/// Abandons the pass if the load hook unwinds.
struct PassGuard<'a, H: UnionHooks> {
    union: &'a Union<H>,
    number: u64,
    armed: bool,
}

impl<H: UnionHooks> Drop for PassGuard<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            warn!(pass = self.number, "load hook panicked, abandoning pass");
            self.union.finish_pass(self.number, None);
        }
    }
}
