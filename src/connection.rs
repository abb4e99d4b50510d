//! Connection sinks that receive encoded messages.

use crate::error::Result;
use crate::message::{EncodedMessage, Message};
use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Outbound side of a client connection.
///
/// `send_encoded` is called while the union holds its ordering lock, so it
/// must not block and must not call back into the union. Sends to a closed
/// connection are silently dropped.
pub trait Connection: Send + Sync {
    fn send_encoded(&self, msg: &EncodedMessage);
}

/// A connection backed by an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelConnection {
    sender: Sender<EncodedMessage>,
}

impl ChannelConnection {
    /// Create a connection and the receiver that reads what it is sent.
    pub fn new() -> (Self, ConnectionReceiver) {
        let (sender, receiver) = unbounded();
        (Self { sender }, ConnectionReceiver { receiver })
    }
}

impl Connection for ChannelConnection {
    fn send_encoded(&self, msg: &EncodedMessage) {
        // Receiver gone means the client went away.
        let _ = self.sender.send(msg.clone());
    }
}

/// Reading end of a [`ChannelConnection`].
pub struct ConnectionReceiver {
    receiver: Receiver<EncodedMessage>,
}

impl ConnectionReceiver {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<EncodedMessage, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<EncodedMessage, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<EncodedMessage, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take everything received so far.
    pub fn drain(&self) -> Vec<EncodedMessage> {
        self.receiver.try_iter().collect()
    }

    /// Take and decode everything received so far.
    pub fn drain_decoded(&self) -> Result<Vec<Message>> {
        self.drain().iter().map(EncodedMessage::decode).collect()
    }

    /// Number of messages waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
