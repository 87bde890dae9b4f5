//! Per-peer message queue
//!
//! Any number of producers push through cloned [`MailboxSender`]s; the
//! owning peer's run loop is the only consumer.

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{Instant, timeout_at};

use crate::message::Message;

/// Outcome of a receive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The oldest pending message
    Message(Message),
    /// Nothing arrived before the deadline (or nothing is queued)
    Empty,
    /// Every sender is gone and the queue is drained
    Closed,
}

/// Producer side of a mailbox
#[derive(Debug, Clone)]
pub struct MailboxSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MailboxSender {
    /// Enqueue a message and wake the consumer.
    ///
    /// Returns false if the consumer has already terminated; the message is
    /// dropped in that case.
    pub fn push(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// True once the owning peer has dropped its mailbox
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a mailbox
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Mailbox {
    /// Create a mailbox and its first sender
    pub fn new() -> (Mailbox, MailboxSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mailbox { rx }, MailboxSender { tx })
    }

    /// Take the oldest message without waiting
    pub fn try_pop(&mut self) -> Received {
        match self.rx.try_recv() {
            Ok(msg) => Received::Message(msg),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Wait for the oldest message until `deadline`, or forever with `None`
    pub async fn pop_blocking(&mut self, deadline: Option<Instant>) -> Received {
        let received = match deadline {
            Some(deadline) => match timeout_at(deadline, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => return Received::Empty,
            },
            None => self.rx.recv().await,
        };

        match received {
            Some(msg) => Received::Message(msg),
            None => Received::Closed,
        }
    }

    /// Number of messages waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
