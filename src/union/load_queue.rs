//! Load coordination: one pass in flight, everyone else grouped by partition.
//!
//! A subscriber arriving while nothing loads becomes the *leader* of a new
//! pass and runs the load hook on its own thread. Later arrivals either join
//! the loading group (same partition) or a waiting group keyed by their
//! partition. When a pass completes, the next waiting group is promoted and
//! its leader is handed the pass through its signal channel.
//!
//! Time partitions are picked greatest bucket first; token partitions in
//! insertion order. If both kinds wait, the kind that did not just run goes
//! next.
//!
//! A subscriber sits in at most one unfinished group. Admitting it again
//! before that group completes only adds a follower to its entry, released
//! together with the group.

use crate::config::UnionConfig;
use crate::message::EncodedMessage;
use crate::partition::PartitionIndex;
use crate::subscriber::Subscriber;
use crate::types::{SubscriberId, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::mem;

/// Partition key of a load pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionKey<T> {
    /// Time bucket. Members have `last_subscribed >= min_last_subscribed`.
    Time {
        bucket: Timestamp,
        min_last_subscribed: Timestamp,
    },
    /// Application token, compared for equality only.
    Token(T),
}

impl<T> PartitionKey<T> {
    pub fn is_time(&self) -> bool {
        matches!(self, PartitionKey::Time { .. })
    }
}

/// Snapshot of a coordinator for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadStatus<T> {
    pub loading: Option<PartitionKey<T>>,
    pub loading_members: usize,
    pub waiting_groups: usize,
    pub waiting_members: usize,
    pub pending_messages: usize,
    pub passes: u64,
}

impl<T> LoadStatus<T> {
    pub fn is_idle(&self) -> bool {
        self.loading.is_none()
    }
}

/// How an arriving subscriber asks to be partitioned.
pub(crate) enum Admit<T> {
    Time(Timestamp),
    Token(T),
}

/// A pass the receiving thread must run.
#[derive(Debug)]
pub(crate) struct Pass<T> {
    pub key: PartitionKey<T>,
    pub number: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PassResult {
    Delivered,
    Abandoned,
}

/// What a waiting subscriber is woken with.
pub(crate) enum Signal<T> {
    Done(PassResult),
    Lead(Pass<T>),
}

pub(crate) enum Admission<T> {
    Lead(Pass<T>),
    Wait(Receiver<Signal<T>>),
}

/// Member of the loading group. The leader has no signal.
pub(crate) struct Waiter<T> {
    pub subscriber: Subscriber,
    pub signal: Option<Sender<Signal<T>>>,
    /// Later admissions of the same subscriber.
    pub followers: Vec<Sender<Signal<T>>>,
}

impl<T> Waiter<T> {
    /// Every channel to release once the pass is over.
    pub fn into_signals(self) -> impl Iterator<Item = Sender<Signal<T>>> {
        self.signal.into_iter().chain(self.followers)
    }
}

/// Member of a waiting group.
struct Queued<T> {
    subscriber: Subscriber,
    last_subscribed: Timestamp,
    signal: Sender<Signal<T>>,
    followers: Vec<Sender<Signal<T>>>,
}

impl<T> Queued<T> {
    fn into_waiter(self) -> Waiter<T> {
        Waiter {
            subscriber: self.subscriber,
            signal: Some(self.signal),
            followers: self.followers,
        }
    }
}

struct LoadingGroup<T> {
    key: PartitionKey<T>,
    members: Vec<Waiter<T>>,
}

impl<T: Eq> LoadingGroup<T> {
    fn accepts(&self, admit: &Admit<T>, config: &UnionConfig) -> bool {
        match (&self.key, admit) {
            (
                PartitionKey::Time {
                    bucket,
                    min_last_subscribed,
                },
                Admit::Time(last_subscribed),
            ) => {
                config.discrete_last_subscribed(*last_subscribed) == *bucket
                    && last_subscribed >= min_last_subscribed
            }
            (PartitionKey::Token(current), Admit::Token(token)) => current == token,
            _ => false,
        }
    }
}

/// A waiting group chosen to load next.
struct Promoted<T> {
    key: PartitionKey<T>,
    leader: Queued<T>,
    rest: Vec<Queued<T>>,
}

/// Shared contract of the two partitioning strategies.
trait WaitQueue<T> {
    type Key;

    fn enqueue(&mut self, key: Self::Key, queued: Queued<T>);

    /// Remove the group that should load next.
    fn promote(&mut self) -> Option<Promoted<T>>;

    fn find_mut(&mut self, id: &SubscriberId) -> Option<&mut Queued<T>>;

    fn group_count(&self) -> usize;

    fn member_count(&self) -> usize;
}

/// Waiting groups keyed by time bucket.
struct TimeQueue<T> {
    groups: PartitionIndex<Timestamp, Vec<Queued<T>>>,
}

impl<T> WaitQueue<T> for TimeQueue<T> {
    type Key = Timestamp;

    fn enqueue(&mut self, bucket: Timestamp, queued: Queued<T>) {
        self.groups.get_or_insert_with(bucket, Vec::new).push(queued);
    }

    fn promote(&mut self) -> Option<Promoted<T>> {
        let (bucket, mut members) = self.groups.pop_last()?;
        // The oldest member leads so the query looks back far enough for all.
        let leader_at = members
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| q.last_subscribed)
            .map(|(i, _)| i)?;
        let leader = members.remove(leader_at);
        Some(Promoted {
            key: PartitionKey::Time {
                bucket,
                min_last_subscribed: leader.last_subscribed,
            },
            leader,
            rest: members,
        })
    }

    fn find_mut(&mut self, id: &SubscriberId) -> Option<&mut Queued<T>> {
        self.groups
            .values_mut()
            .flat_map(|group| group.iter_mut())
            .find(|q| q.subscriber.id == *id)
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn member_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Waiting groups keyed by token, served in insertion order.
struct TokenQueue<T> {
    groups: HashMap<T, Vec<Queued<T>>>,
    order: VecDeque<T>,
}

impl<T: Eq + Hash + Clone> WaitQueue<T> for TokenQueue<T> {
    type Key = T;

    fn enqueue(&mut self, token: T, queued: Queued<T>) {
        match self.groups.get_mut(&token) {
            Some(group) => group.push(queued),
            None => {
                self.order.push_back(token.clone());
                self.groups.insert(token, vec![queued]);
            }
        }
    }

    fn promote(&mut self) -> Option<Promoted<T>> {
        while let Some(token) = self.order.pop_front() {
            if let Some(mut members) = self.groups.remove(&token) {
                let Some(leader) = members.pop() else {
                    continue;
                };
                return Some(Promoted {
                    key: PartitionKey::Token(token),
                    leader,
                    rest: members,
                });
            }
        }
        None
    }

    fn find_mut(&mut self, id: &SubscriberId) -> Option<&mut Queued<T>> {
        self.groups
            .values_mut()
            .flat_map(|group| group.iter_mut())
            .find(|q| q.subscriber.id == *id)
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn member_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// The pass to start after a completion, and who runs it.
pub(crate) struct NextPass<T> {
    pub leader: Subscriber,
    pub signal: Sender<Signal<T>>,
    pub pass: Pass<T>,
}

/// Outcome of [`LoadCoordinator::complete`].
pub(crate) struct Completion<T> {
    /// Members of the pass that just finished.
    pub finished: Vec<Waiter<T>>,
    pub next: Option<NextPass<T>>,
    /// Messages held back during loading; non-empty only once idle.
    pub flush: Vec<EncodedMessage>,
}

/// Per-union coordinator state. Lives behind the union's state lock.
pub(crate) struct LoadCoordinator<T> {
    loading: Option<LoadingGroup<T>>,
    by_time: TimeQueue<T>,
    by_token: TokenQueue<T>,
    pending: Vec<EncodedMessage>,
    config: UnionConfig,
    passes: u64,
}

impl<T: Eq + Hash + Clone> LoadCoordinator<T> {
    pub fn new(config: UnionConfig) -> Self {
        Self {
            loading: None,
            by_time: TimeQueue {
                groups: PartitionIndex::new(),
            },
            by_token: TokenQueue {
                groups: HashMap::new(),
                order: VecDeque::new(),
            },
            pending: Vec::new(),
            config,
            passes: 0,
        }
    }

    /// True while a pass is loading (waiting groups imply one is).
    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    /// Hold a message back until the coordinator is idle.
    pub fn queue_message(&mut self, msg: EncodedMessage) {
        self.pending.push(msg);
    }

    /// Place an arriving subscriber.
    pub fn admit(&mut self, subscriber: Subscriber, admit: Admit<T>) -> Admission<T> {
        if let Some(followers) = self.followers_of(&subscriber.id) {
            let (signal, receiver) = bounded(1);
            followers.push(signal);
            return Admission::Wait(receiver);
        }

        let Some(group) = self.loading.as_mut() else {
            let key = match admit {
                Admit::Time(last_subscribed) => PartitionKey::Time {
                    bucket: self.config.discrete_last_subscribed(last_subscribed),
                    min_last_subscribed: last_subscribed,
                },
                Admit::Token(token) => PartitionKey::Token(token),
            };
            self.passes += 1;
            let pass = Pass {
                key: key.clone(),
                number: self.passes,
            };
            self.loading = Some(LoadingGroup {
                key,
                members: vec![Waiter {
                    subscriber,
                    signal: None,
                    followers: Vec::new(),
                }],
            });
            return Admission::Lead(pass);
        };

        let (signal, receiver) = bounded(1);

        if group.accepts(&admit, &self.config) {
            group.members.push(Waiter {
                subscriber,
                signal: Some(signal),
                followers: Vec::new(),
            });
            return Admission::Wait(receiver);
        }

        let last_subscribed = match &admit {
            Admit::Time(last_subscribed) => *last_subscribed,
            Admit::Token(_) => subscriber.last_subscribed,
        };
        let queued = Queued {
            subscriber,
            last_subscribed,
            signal,
            followers: Vec::new(),
        };
        match admit {
            Admit::Time(last_subscribed) => {
                let bucket = self.config.discrete_last_subscribed(last_subscribed);
                self.by_time.enqueue(bucket, queued)
            }
            Admit::Token(token) => self.by_token.enqueue(token, queued),
        }
        Admission::Wait(receiver)
    }

    /// Followers of `id` if it is still in an unfinished group.
    fn followers_of(&mut self, id: &SubscriberId) -> Option<&mut Vec<Sender<Signal<T>>>> {
        let loading = self.loading.as_mut()?;
        if let Some(waiter) = loading.members.iter_mut().find(|w| w.subscriber.id == *id) {
            return Some(&mut waiter.followers);
        }
        match self.by_time.find_mut(id) {
            Some(queued) => Some(&mut queued.followers),
            None => self.by_token.find_mut(id).map(|q| &mut q.followers),
        }
    }

    /// Close the loading pass and promote the next waiting group, if any.
    pub fn complete(&mut self) -> Completion<T> {
        let finished = self.loading.take();
        let time_ran = finished.as_ref().is_some_and(|g| g.key.is_time());
        let finished = finished.map(|g| g.members).unwrap_or_default();

        let promoted = if time_ran {
            self.by_token.promote().or_else(|| self.by_time.promote())
        } else {
            self.by_time.promote().or_else(|| self.by_token.promote())
        };

        let Some(Promoted { key, leader, rest }) = promoted else {
            return Completion {
                finished,
                next: None,
                flush: mem::take(&mut self.pending),
            };
        };

        self.passes += 1;
        let pass = Pass {
            key: key.clone(),
            number: self.passes,
        };

        let mut members = Vec::with_capacity(rest.len() + 1);
        members.push(Waiter {
            subscriber: leader.subscriber.clone(),
            signal: None,
            followers: leader.followers,
        });
        members.extend(rest.into_iter().map(Queued::into_waiter));
        self.loading = Some(LoadingGroup { key, members });

        Completion {
            finished,
            next: Some(NextPass {
                leader: leader.subscriber,
                signal: leader.signal,
                pass,
            }),
            flush: Vec::new(),
        }
    }

    pub fn status(&self) -> LoadStatus<T> {
        LoadStatus {
            loading: self.loading.as_ref().map(|g| g.key.clone()),
            loading_members: self.loading.as_ref().map_or(0, |g| g.members.len()),
            waiting_groups: self.by_time.group_count() + self.by_token.group_count(),
            waiting_members: self.by_time.member_count() + self.by_token.member_count(),
            pending_messages: self.pending.len(),
            passes: self.passes,
        }
    }
}
