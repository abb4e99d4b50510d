//! Integration tests for unions.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use union_sync::*;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Load {
    Time(Timestamp),
    Token(String),
}

/// Hooks whose loads block until the test releases them.
struct Gated {
    feed: ChangeFeed,
    started: Sender<Load>,
    release: Receiver<Vec<Document>>,
    inits: AtomicUsize,
    empties: AtomicUsize,
}

impl Gated {
    fn fill(&self, encoder: &mut LoadEncoder) -> Result<()> {
        let docs = self
            .release
            .recv()
            .map_err(|_| UnionError::load("test harness dropped"))?;
        for doc in &docs {
            encoder.add_doc(doc);
        }
        Ok(())
    }
}

impl UnionHooks for Gated {
    type Token = String;

    fn init_observers(&self, union: &Union<Self>) {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let handle = self.feed.on_change(union.batch_update().into_observer());
        union.push_handle(Box::new(handle));
    }

    fn on_empty(&self, _union: &Union<Self>) {
        self.empties.fetch_add(1, Ordering::SeqCst);
    }

    fn load_initial(&self, encoder: &mut LoadEncoder, min: Timestamp) -> Result<()> {
        self.started.send(Load::Time(min)).unwrap();
        self.fill(encoder)
    }

    fn load_by_token(&self, encoder: &mut LoadEncoder, token: &String) -> Result<()> {
        self.started.send(Load::Token(token.clone())).unwrap();
        self.fill(encoder)
    }
}

struct Harness {
    union: Union<Gated>,
    started: Receiver<Load>,
    release: Sender<Vec<Document>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(UnionConfig::default())
    }

    fn with_config(config: UnionConfig) -> Self {
        init_tracing();
        let (started_tx, started) = unbounded();
        let (release, release_rx) = unbounded();
        let union = Union::with_config(
            Gated {
                feed: ChangeFeed::new(),
                started: started_tx,
                release: release_rx,
                inits: AtomicUsize::new(0),
                empties: AtomicUsize::new(0),
            },
            config,
        );
        Self {
            union,
            started,
            release,
        }
    }

    fn next_load(&self) -> Load {
        self.started.recv_timeout(TIMEOUT).unwrap()
    }

    fn release(&self, docs: Vec<Document>) {
        self.release.send(docs).unwrap();
    }

    fn feed(&self) -> &ChangeFeed {
        &self.union.hooks().feed
    }

    fn wait_for(&self, what: &str, cond: impl Fn(&LoadStatus<String>) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond(&self.union.load_status()) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn_add(&self, sub: &Subscriber, last_subscribed: Timestamp) -> JoinHandle<Result<()>> {
        let union = self.union.clone();
        let sub = sub.clone();
        thread::spawn(move || union.add_sub_at(&sub, last_subscribed))
    }

    fn spawn_add_by_token(&self, sub: &Subscriber, token: &str) -> JoinHandle<Result<()>> {
        let union = self.union.clone();
        let sub = sub.clone();
        let token = token.to_string();
        thread::spawn(move || union.add_sub_by_token(&sub, token))
    }
}

/// Route crate logs to the test output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn client(id: &str) -> (Subscriber, ConnectionReceiver) {
    let (conn, rx) = ChannelConnection::new();
    (Subscriber::new(id, Arc::new(conn)), rx)
}

/// Current time rounded down to the default interval.
fn base() -> Timestamp {
    Timestamp::now().floor_to(UnionConfig::default().last_subscribed_interval)
}

fn at(base: Timestamp, offset: i64) -> Timestamp {
    Timestamp(base.0 + offset)
}

fn book(id: &str) -> Document {
    Document::new("Book", id).with("name", format!("Book {}", id))
}

// --- Admission and grouping ---

#[test]
fn test_same_bucket_shares_one_load() {
    let h = Harness::new();
    let now = base();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");

    let t1 = h.spawn_add(&sub1, at(now, 10_000));
    assert_eq!(h.next_load(), Load::Time(at(now, 10_000)));

    let t2 = h.spawn_add(&sub2, at(now, 20_000));
    h.wait_for("sub2 to join", |s| s.loading_members == 2);
    assert!(rx1.is_empty());

    h.release(vec![book("b1"), book("b2")]);
    t1.join().unwrap().unwrap();
    t2.join().unwrap().unwrap();

    let m1 = rx1.drain();
    let m2 = rx2.drain();
    assert_eq!(m1.len(), 1);
    assert_eq!(m1, m2);
    assert_eq!(
        m1[0].decode().unwrap(),
        Message::Batch(vec![Update::added(&book("b1")), Update::added(&book("b2"))])
    );
    assert!(h.started.try_recv().is_err());
    assert_eq!(h.union.load_status().passes, 1);
}

#[test]
fn test_later_bucket_gets_its_own_pass() {
    let h = Harness::with_config(UnionConfig {
        last_subscribed_interval: Duration::from_secs(30),
        ..UnionConfig::default()
    });
    let now = base();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");

    let t1 = h.spawn_add(&sub1, now);
    assert_eq!(h.next_load(), Load::Time(now));

    let t2 = h.spawn_add(&sub2, at(now, 30_000));
    h.wait_for("sub2 to queue", |s| s.waiting_members == 1);
    assert_eq!(h.union.load_status().loading_members, 1);

    h.release(vec![book("b1")]);
    assert_eq!(h.next_load(), Load::Time(at(now, 30_000)));
    t1.join().unwrap().unwrap();
    assert_eq!(rx1.len(), 1);
    assert!(rx2.is_empty());

    h.release(vec![book("b2")]);
    t2.join().unwrap().unwrap();
    assert_eq!(rx1.len(), 1);
    assert_eq!(
        rx2.drain_decoded().unwrap(),
        vec![Message::Batch(vec![Update::added(&book("b2"))])]
    );
    assert!(h.union.load_status().is_idle());
}

#[test]
fn test_equal_tokens_share_a_pass() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");
    let (sub3, rx3) = client("sub3");

    let t1 = h.spawn_add_by_token(&sub1, "admin");
    assert_eq!(h.next_load(), Load::Token("admin".into()));
    let t2 = h.spawn_add_by_token(&sub2, "guest");
    h.wait_for("sub2 to queue", |s| s.waiting_members == 1);
    let t3 = h.spawn_add_by_token(&sub3, "admin");
    h.wait_for("sub3 to join", |s| s.loading_members == 2);

    h.release(vec![book("secret")]);
    assert_eq!(h.next_load(), Load::Token("guest".into()));
    t1.join().unwrap().unwrap();
    t3.join().unwrap().unwrap();
    assert_eq!(rx1.drain(), rx3.drain());
    assert!(rx2.is_empty());

    h.release(vec![book("public")]);
    t2.join().unwrap().unwrap();
    assert_eq!(
        rx2.drain_decoded().unwrap(),
        vec![Message::Batch(vec![Update::added(&book("public"))])]
    );
    assert_eq!(h.union.load_status().passes, 2);
}

#[test]
fn test_empty_snapshot_sends_nothing() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");

    let t1 = h.spawn_add_by_token(&sub1, "none");
    h.next_load();
    h.release(vec![]);
    t1.join().unwrap().unwrap();

    assert!(rx1.is_empty());
    assert!(h.union.has_sub(&sub1));
}

// --- Ordering ---

#[test]
fn test_mutations_during_load_follow_the_snapshot() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();

    h.feed()
        .notify(&DocChange::add(book("live")), &NoTransaction);
    assert!(rx1.is_empty());
    assert_eq!(h.union.load_status().pending_messages, 1);

    h.release(vec![book("snap")]);
    t1.join().unwrap().unwrap();

    assert_eq!(
        rx1.drain_decoded().unwrap(),
        vec![
            Message::Batch(vec![Update::added(&book("snap"))]),
            Message::Single(Update::added(&book("live"))),
        ]
    );
}

#[test]
fn test_held_messages_wait_for_every_queued_group() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");

    let t1 = h.spawn_add_by_token(&sub1, "a");
    h.next_load();
    let t2 = h.spawn_add_by_token(&sub2, "b");
    h.wait_for("sub2 to queue", |s| s.waiting_members == 1);

    let msg = h
        .union
        .encode_update(&DocChange::add(book("live")))
        .unwrap()
        .unwrap();
    h.union.send_encoded(&msg);

    h.release(vec![book("a1")]);
    h.next_load();
    t1.join().unwrap().unwrap();
    // sub1 has its snapshot, but the live update waits for sub2's.
    assert_eq!(rx1.len(), 1);
    assert_eq!(h.union.load_status().pending_messages, 1);

    h.release(vec![book("b1")]);
    t2.join().unwrap().unwrap();

    let m1 = rx1.drain();
    assert_eq!(m1.len(), 2);
    assert_eq!(m1[1], msg);
    let m2 = rx2.drain();
    assert_eq!(m2.len(), 2);
    assert!(m2[0].is_batch());
    assert_eq!(m2[1], msg);
}

#[test]
fn test_send_encoded_now_skips_the_gate() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();

    let msg = encode_update(&Update::added(&book("urgent"))).unwrap();
    h.union.send_encoded_now(&msg);
    assert_eq!(rx1.recv_timeout(TIMEOUT).unwrap(), msg);

    h.release(vec![]);
    t1.join().unwrap().unwrap();
}

#[test]
fn test_one_pass_at_a_time() {
    struct Exclusive {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Exclusive {
        fn load(&self, encoder: &mut LoadEncoder) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            encoder.add_doc(&book("b"));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl UnionHooks for Exclusive {
        type Token = u8;

        fn load_initial(&self, encoder: &mut LoadEncoder, _min: Timestamp) -> Result<()> {
            self.load(encoder)
        }

        fn load_by_token(&self, encoder: &mut LoadEncoder, _token: &u8) -> Result<()> {
            self.load(encoder)
        }
    }

    let union = Union::new(Exclusive {
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
    });
    let now = base();

    let clients: Vec<_> = (0..24).map(|i| client(&format!("sub{}", i))).collect();
    let threads: Vec<_> = clients
        .iter()
        .enumerate()
        .map(|(i, (sub, _))| {
            let union = union.clone();
            let sub = sub.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    union.add_sub_by_token(&sub, (i % 5) as u8)
                } else {
                    union.add_sub_at(&sub, at(now, -(i as i64) * 100_000))
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap().unwrap();
    }

    assert_eq!(union.hooks().max_active.load(Ordering::SeqCst), 1);
    assert_eq!(union.count(), 24);
    for (_, rx) in &clients {
        assert_eq!(rx.len(), 1);
    }
    assert!(union.load_status().is_idle());
}

// --- Membership ---

#[test]
fn test_remove_sub_is_idempotent() {
    let h = Harness::new();
    let (sub1, _rx1) = client("sub1");
    let (sub2, _rx2) = client("sub2");

    for sub in [&sub1, &sub2] {
        let t = h.spawn_add_by_token(sub, "t");
        h.next_load();
        h.release(vec![]);
        t.join().unwrap().unwrap();
    }
    assert_eq!(h.union.count(), 2);

    h.union.remove_sub(&sub1);
    h.union.remove_sub(&sub1);
    assert_eq!(h.union.count(), 1);
    assert!(!h.union.has_sub(&sub1));
    assert!(h.union.has_sub(&sub2));
    assert_eq!(h.union.hooks().empties.load(Ordering::SeqCst), 0);
}

#[test]
fn test_observer_lifecycle_follows_membership() {
    let h = Harness::new();
    let (sub1, _rx1) = client("sub1");
    let (sub2, _rx2) = client("sub2");

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();
    assert_eq!(h.feed().observer_count(), 1);
    let t2 = h.spawn_add_by_token(&sub2, "t");
    h.wait_for("sub2 to join", |s| s.loading_members == 2);
    h.release(vec![]);
    t1.join().unwrap().unwrap();
    t2.join().unwrap().unwrap();

    assert_eq!(h.union.hooks().inits.load(Ordering::SeqCst), 1);
    assert_eq!(h.union.handle_count(), 1);

    h.union.remove_sub(&sub1);
    h.union.remove_sub(&sub2);
    assert_eq!(h.union.hooks().empties.load(Ordering::SeqCst), 1);
    assert_eq!(h.union.handle_count(), 0);
    assert_eq!(h.feed().observer_count(), 0);

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();
    h.release(vec![]);
    t1.join().unwrap().unwrap();
    assert_eq!(h.union.hooks().inits.load(Ordering::SeqCst), 2);
    assert_eq!(h.feed().observer_count(), 1);
}

#[test]
fn test_removed_subscriber_still_gets_its_pass() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();
    h.union.remove_sub(&sub1);
    assert_eq!(h.union.count(), 0);

    h.release(vec![book("b1")]);
    t1.join().unwrap().unwrap();
    assert_eq!(rx1.len(), 1);
}

#[test]
fn test_subscriber_in_two_unions() {
    let a = Harness::new();
    let b = Harness::new();
    let (sub1, rx1) = client("sub1");

    let ta = a.spawn_add_by_token(&sub1, "x");
    let tb = b.spawn_add_by_token(&sub1, "y");
    assert_eq!(a.next_load(), Load::Token("x".into()));
    assert_eq!(b.next_load(), Load::Token("y".into()));
    a.release(vec![book("from-a")]);
    b.release(vec![book("from-b")]);
    ta.join().unwrap().unwrap();
    tb.join().unwrap().unwrap();

    let mut ids: Vec<String> = rx1
        .drain_decoded()
        .unwrap()
        .into_iter()
        .flat_map(Message::into_updates)
        .map(|u| u.id().0.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["from-a", "from-b"]);

    a.union.remove_sub(&sub1);
    assert!(!a.union.has_sub(&sub1));
    assert!(b.union.has_sub(&sub1));
}

#[test]
fn test_readmitted_while_queued_stays_in_one_group() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");

    let t1 = h.spawn_add_by_token(&sub1, "a");
    assert_eq!(h.next_load(), Load::Token("a".into()));
    let t2 = h.spawn_add_by_token(&sub2, "b");
    h.wait_for("sub2 to queue", |s| s.waiting_members == 1);

    h.union.remove_sub(&sub2);
    let t3 = h.spawn_add_by_token(&sub2, "c");
    h.wait_for("sub2 to come back", |_| h.union.has_sub(&sub2));
    let status = h.union.load_status();
    assert_eq!(status.loading_members, 1);
    assert_eq!(status.waiting_groups, 1);
    assert_eq!(status.waiting_members, 1);

    h.release(vec![book("a1")]);
    assert_eq!(h.next_load(), Load::Token("b".into()));
    h.release(vec![book("b1")]);
    t1.join().unwrap().unwrap();
    t2.join().unwrap().unwrap();
    t3.join().unwrap().unwrap();

    assert_eq!(rx1.len(), 1);
    assert_eq!(
        rx2.drain_decoded().unwrap(),
        vec![Message::Batch(vec![Update::added(&book("b1"))])]
    );
    assert!(h.started.try_recv().is_err());
    assert_eq!(h.union.load_status().passes, 2);
    assert!(h.union.load_status().is_idle());
}

#[test]
fn test_id_reused_on_a_new_connection_is_ignored() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    admitted(&h, &sub1);

    let (again, rx_again) = client("sub1");
    h.union.add_sub_by_token(&again, "t".into()).unwrap();
    assert!(h.started.try_recv().is_err());
    assert!(rx_again.is_empty());
    assert_eq!(h.union.count(), 1);

    // Removing by id frees it for the new connection.
    h.union.remove_sub(&again);
    assert!(!h.union.has_sub(&sub1));
    let t = h.spawn_add_by_token(&again, "t");
    h.next_load();
    h.release(vec![book("b1")]);
    t.join().unwrap().unwrap();
    assert_eq!(rx_again.len(), 1);
    assert!(rx1.is_empty());
}

// --- Transactions ---

fn admitted(h: &Harness, sub: &Subscriber) {
    let t = h.spawn_add_by_token(sub, "t");
    h.next_load();
    h.release(vec![]);
    t.join().unwrap().unwrap();
}

#[test]
fn test_transaction_sends_one_ordered_batch() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    let (sub2, rx2) = client("sub2");
    admitted(&h, &sub1);
    admitted(&h, &sub2);

    let a = book("A").with("name", "renamed");
    let b = book("B");
    let c = book("C");
    let mut undo = Attributes::new();
    undo.insert("name".into(), json!("Book A"));

    let result: std::result::Result<(), String> = Transaction::run(|tx| {
        h.feed().notify(&DocChange::change(a.clone(), undo.clone()), tx);
        h.feed().notify(&DocChange::add(b.clone()), tx);
        h.feed().notify(&DocChange::remove(c.clone()), tx);
        assert!(rx1.is_empty());
        Ok(())
    });
    result.unwrap();

    let mut fields = Attributes::new();
    fields.insert("name".into(), json!("renamed"));
    let expected = vec![Message::Batch(vec![
        Update::changed(&a, fields),
        Update::added(&b),
        Update::removed(&c, None),
    ])];
    assert_eq!(rx1.drain_decoded().unwrap(), expected);
    assert_eq!(rx2.drain_decoded().unwrap(), expected);
}

#[test]
fn test_aborted_transaction_sends_nothing() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    admitted(&h, &sub1);

    let result: std::result::Result<(), &str> = Transaction::run(|tx| {
        h.feed().notify(&DocChange::add(book("B")), tx);
        h.feed().notify(&DocChange::remove(book("C")), tx);
        Err("rolled back")
    });

    assert_eq!(result, Err("rolled back"));
    assert!(rx1.is_empty());
    assert_eq!(h.union.batch_update().open_transactions(), 0);
}

#[test]
fn test_transaction_commit_during_load_is_held() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");

    let t1 = h.spawn_add_by_token(&sub1, "t");
    h.next_load();

    let result: std::result::Result<(), String> = Transaction::run(|tx| {
        h.feed().notify(&DocChange::add(book("B")), tx);
        Ok(())
    });
    result.unwrap();
    assert!(rx1.is_empty());

    h.release(vec![book("A")]);
    t1.join().unwrap().unwrap();
    assert_eq!(
        rx1.drain_decoded().unwrap(),
        vec![
            Message::Batch(vec![Update::added(&book("A"))]),
            Message::Batch(vec![Update::added(&book("B"))]),
        ]
    );
}

#[test]
fn test_concurrent_transactions_do_not_mix() {
    let h = Harness::new();
    let (sub1, rx1) = client("sub1");
    admitted(&h, &sub1);

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let union = h.union.clone();
            thread::spawn(move || {
                let feed = &union.hooks().feed;
                let result: std::result::Result<(), String> = Transaction::run(|tx| {
                    for j in 0..5 {
                        feed.notify(&DocChange::add(book(&format!("{}-{}", i, j))), tx);
                    }
                    Ok(())
                });
                result.unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let msgs = rx1.drain_decoded().unwrap();
    assert_eq!(msgs.len(), 4);
    for msg in msgs {
        let ids: Vec<String> = msg.into_updates().iter().map(|u| u.id().0.clone()).collect();
        assert_eq!(ids.len(), 5);
        let prefix = ids[0].split('-').next().unwrap().to_string();
        for (j, id) in ids.iter().enumerate() {
            assert_eq!(*id, format!("{}-{}", prefix, j));
        }
    }
}
