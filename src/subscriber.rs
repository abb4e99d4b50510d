//! One client's interest registered with a union.

use crate::connection::Connection;
use crate::message::EncodedMessage;
use crate::types::{SubscriberId, Timestamp};
use std::fmt;
use std::sync::Arc;

/// A client subscription (a "publication").
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub last_subscribed: Timestamp,
    connection: Arc<dyn Connection>,
}

impl Subscriber {
    /// A subscriber that has never subscribed before.
    ///
    /// A union identifies members by `id`, so an id must name one live
    /// subscription. Admitting another value with a member's id is a no-op
    /// even if it carries a new connection; remove the old one first.
    pub fn new(id: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        Self {
            id: SubscriberId::new(id),
            last_subscribed: Timestamp::NEVER,
            connection,
        }
    }

    /// Set when the client last subscribed.
    pub fn with_last_subscribed(mut self, last_subscribed: Timestamp) -> Self {
        self.last_subscribed = last_subscribed;
        self
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn send_encoded(&self, msg: &EncodedMessage) {
        self.connection.send_encoded(msg);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("last_subscribed", &self.last_subscribed)
            .finish()
    }
}
