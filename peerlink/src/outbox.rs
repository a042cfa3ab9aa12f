//! Write queues.
//!
//! Every connection, local or peer, owns one unbounded FIFO drained by a single writing task. Any task may push onto
//! it through an [Outbox].
use tokio::sync::mpsc;

use crate::api::{Envelope, Uid};

/// An item on a write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// An envelope to transmit.
    Send(Envelope),
    /// The read side of `connection` failed. Its writer must stop.
    Closed { connection: u64 },
}

/// The producer half of a write queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    /// Creates a new queue, returning the producer and the single consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an envelope. Returns false when the consumer is gone.
    pub fn push(&self, envelope: impl Into<Envelope>) -> bool {
        self.tx.send(Outgoing::Send(envelope.into())).is_ok()
    }

    /// Whether both producers feed the same queue.
    pub fn same_queue(&self, other: &Outbox) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Tells the writer of `connection` to stop.
    pub fn close(&self, connection: u64) {
        let _ = self.tx.send(Outgoing::Closed { connection });
    }
}

/// A live session served by this node.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub uid: Uid,
    /// Unix seconds at which the session became active.
    pub last_active: i64,
    pub outbox: Outbox,
}

impl ClientHandle {
    /// Creates a handle for `uid` along with the queue its connection writer drains.
    pub fn new(uid: Uid, last_active: i64) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, rx) = Outbox::channel();
        (
            Self {
                uid,
                last_active,
                outbox,
            },
            rx,
        )
    }
}
