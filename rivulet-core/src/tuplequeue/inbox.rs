//! Pipeline inbox: the thread-safe entry point into a pipeline replica.
//!
//! Uses a bounded crossbeam channel, so an upstream runner offering into a
//! full inbox blocks (backpressure) until the owning runner drains it.
//! Blocked sends wake up periodically to check the flow-wide [`FailureFlag`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};

use crate::types::Tuple;

/// Tuples for one input port of the receiving operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleBatch {
    pub port: usize,
    pub tuples: Vec<Tuple>,
}

/// Flow-wide failure flag shared by every downstream sender.
#[derive(Debug, Clone, Default)]
pub struct FailureFlag {
    failed: Arc<AtomicBool>,
}

impl FailureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Sender side of an inbox.
#[derive(Debug, Clone)]
pub struct InboxSender {
    sender: Sender<TupleBatch>,
}

impl InboxSender {
    /// Sends a batch, blocking while the inbox is full.
    ///
    /// Fails once `failure` is set or the inbox is gone.
    pub fn send(&self, batch: TupleBatch, failure: &FailureFlag, retry_interval: Duration) -> Result<()> {
        let mut batch = batch;
        loop {
            if failure.is_set() {
                bail!("flow failed, dropping batch for port {}", batch.port);
            }
            match self.sender.send_timeout(batch, retry_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => batch = returned,
                Err(SendTimeoutError::Disconnected(_)) => bail!("inbox closed: receiver dropped"),
            }
        }
    }

    /// Whether both senders feed the same inbox.
    pub fn same_inbox(&self, other: &InboxSender) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// Receiver side of an inbox, owned by the first operator replica of a pipeline replica.
#[derive(Debug)]
pub struct Inbox {
    receiver: Receiver<TupleBatch>,
    sender: Sender<TupleBatch>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { receiver, sender }
    }

    pub fn sender(&self) -> InboxSender {
        InboxSender {
            sender: self.sender.clone(),
        }
    }

    /// Takes every batch currently buffered, without blocking.
    pub fn drain(&self) -> Vec<TupleBatch> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/inbox_tests.rs"]
mod tests;
