//! # Union Sync
//!
//! Subscription unions: many clients with related interests share one
//! snapshot load, then receive live updates strictly after that snapshot.
//!
//! ## Core Concepts
//!
//! - **Union**: a group of subscribers and the hooks that load their documents
//! - **Load pass**: one run of a load hook, delivered to a whole partition
//! - **Partition**: subscribers grouped by `last_subscribed` time bucket or by token
//! - **Batch update**: all changes of one transaction, sent as one message
//!
//! ## Example
//!
//! ```ignore
//! use union_sync::{ChangeFeed, ChannelConnection, LoadEncoder, Subscriber, Union, UnionHooks};
//!
//! struct Books { feed: ChangeFeed }
//!
//! impl UnionHooks for Books {
//!     type Token = String;
//!
//!     fn init_observers(&self, union: &Union<Self>) {
//!         let handle = self.feed.on_change(union.batch_update().into_observer());
//!         union.push_handle(Box::new(handle));
//!     }
//!
//!     fn load_initial(&self, encoder: &mut LoadEncoder, min: Timestamp) -> Result<()> {
//!         for doc in books_changed_since(min) {
//!             encoder.add_doc(&doc);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let union = Union::new(Books { feed });
//! let (conn, rx) = ChannelConnection::new();
//! union.add_sub(&Subscriber::new("sub1", Arc::new(conn)))?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod feed;
pub mod message;
pub mod partition;
pub mod subscriber;
pub mod transaction;
pub mod types;
pub mod union;

// Re-exports
pub use config::UnionConfig;
pub use connection::{ChannelConnection, Connection, ConnectionReceiver};
pub use error::{Result, UnionError};
pub use feed::{ChangeCallback, ChangeFeed, ChangeFeedHandle, ObserverHandle};
pub use message::{
    decode_message, encode_update, with_batch, Batch, EncodedMessage, Message, Update, BATCH_TAG,
};
pub use partition::{MemberList, MembershipHandle, PartitionHandle, PartitionIndex};
pub use subscriber::Subscriber;
pub use transaction::{NoTransaction, Transaction, TransactionContext, TxCallback};
pub use types::*;
pub use union::{BatchUpdate, LoadEncoder, LoadStatus, PartitionKey, Union, UnionHooks};
