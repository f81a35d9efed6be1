//! One-shot completion handles.
//!
//! A [`Completer`] / [`Completion`] pair is a oneshot channel: the side that
//! performs an operation keeps the completer, the caller waits on the
//! completion. Dropping a completer without completing it resolves the
//! completion with an illegal-state error.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

use crate::error::{EngineError, EngineResult};

/// Producer side of a oneshot result.
#[derive(Debug)]
pub struct Completer<T> {
    sender: Sender<EngineResult<T>>,
}

impl<T> Completer<T> {
    /// Resolves the paired completion. A caller that stopped waiting is ignored.
    pub fn complete(self, result: EngineResult<T>) {
        let _ = self.sender.send(result);
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: EngineError) {
        self.complete(Err(error));
    }
}

/// Consumer side of a oneshot result.
#[derive(Debug)]
pub struct Completion<T> {
    receiver: Receiver<EngineResult<T>>,
}

impl<T> Completion<T> {
    pub fn pending() -> (Completer<T>, Completion<T>) {
        let (sender, receiver) = bounded(1);
        (Completer { sender }, Completion { receiver })
    }

    /// A completion that is already resolved.
    pub fn ready(result: EngineResult<T>) -> Self {
        let (completer, completion) = Self::pending();
        completer.complete(result);
        completion
    }

    /// True once a result is available. Does not consume it.
    pub fn is_done(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Blocks until the result is available.
    pub fn wait(self) -> EngineResult<T> {
        self.receiver.recv().unwrap_or_else(|_| Err(abandoned()))
    }

    /// Blocks for at most `timeout`. Returns `None` if the result is not
    /// available yet; the completion can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineResult<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<EngineResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

fn abandoned() -> EngineError {
    EngineError::illegal_state("operation abandoned before completion")
}

#[cfg(test)]
#[path = "tests/completion_tests.rs"]
mod tests;
