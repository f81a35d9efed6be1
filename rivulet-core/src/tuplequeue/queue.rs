use std::collections::VecDeque;

use crate::types::Tuple;

/// Unbounded single-threaded FIFO of tuples.
#[derive(Debug, Clone, Default)]
pub struct TupleQueue {
    tuples: VecDeque<Tuple>,
}

impl TupleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, tuple: Tuple) {
        self.tuples.push_back(tuple);
    }

    pub fn offer_all(&mut self, tuples: impl IntoIterator<Item = Tuple>) {
        self.tuples.extend(tuples);
    }

    /// Removes up to `limit` tuples from the head.
    pub fn poll(&mut self, limit: usize) -> Vec<Tuple> {
        let count = limit.min(self.tuples.len());
        self.tuples.drain(..count).collect()
    }

    pub fn poll_all(&mut self) -> Vec<Tuple> {
        self.tuples.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.tuples.len();
        self.tuples.clear();
        count
    }
}
