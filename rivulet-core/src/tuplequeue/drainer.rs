//! # Drain policies
//!
//! A drainer takes tuples out of the per-port queues of one key and collects
//! them as the input of the next operator invocation.
//!
//! - [`GreedyDrainer`] takes everything, regardless of thresholds. Used when an
//!   operator flushes its remaining input before completing.
//! - [`TupleCountDrainer`] honours a tuple-availability strategy.

use crate::operator::{TupleAvailability, TupleAvailabilityByCount, TupleAvailabilityByPort};
use crate::types::{PartitionKey, Tuples};

use super::TupleQueue;

pub trait TupleQueueDrainer {
    /// Drains the queues of `key` into the drainer's result.
    /// `may_skip_blocking` allows a blocking implementation to give up instead
    /// of waiting; the drainers in this crate never block.
    fn drain(&mut self, may_skip_blocking: bool, key: Option<&PartitionKey>, queues: &mut [TupleQueue]);

    fn result(&self) -> &Tuples;

    /// Key whose tuples are in the result.
    fn key(&self) -> Option<&PartitionKey>;

    /// Hands out the result and resets the drainer.
    fn take(&mut self) -> (Option<PartitionKey>, Tuples);

    fn reset(&mut self);

    fn is_greedy(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct GreedyDrainer {
    input_port_count: usize,
    key: Option<PartitionKey>,
    result: Tuples,
}

impl GreedyDrainer {
    pub fn new(input_port_count: usize) -> Self {
        Self {
            input_port_count,
            key: None,
            result: Tuples::new(input_port_count),
        }
    }
}

impl TupleQueueDrainer for GreedyDrainer {
    fn drain(&mut self, _may_skip_blocking: bool, key: Option<&PartitionKey>, queues: &mut [TupleQueue]) {
        for (port, queue) in queues.iter_mut().enumerate() {
            self.result.add_all(port, queue.poll_all());
        }
        if !self.result.is_empty() {
            self.key = key.cloned();
        }
    }

    fn result(&self) -> &Tuples {
        &self.result
    }

    fn key(&self) -> Option<&PartitionKey> {
        self.key.as_ref()
    }

    fn take(&mut self) -> (Option<PartitionKey>, Tuples) {
        let result = std::mem::replace(&mut self.result, Tuples::new(self.input_port_count));
        (self.key.take(), result)
    }

    fn reset(&mut self) {
        self.key = None;
        self.result = Tuples::new(self.input_port_count);
    }

    fn is_greedy(&self) -> bool {
        true
    }
}

/// Drains according to per-port tuple count thresholds.
#[derive(Debug)]
pub struct TupleCountDrainer {
    availability: TupleAvailability,
    key: Option<PartitionKey>,
    result: Tuples,
}

impl TupleCountDrainer {
    pub fn new(availability: TupleAvailability) -> Self {
        let port_count = availability.port_count();
        Self {
            availability,
            key: None,
            result: Tuples::new(port_count),
        }
    }

    pub fn availability(&self) -> &TupleAvailability {
        &self.availability
    }

    fn drain_port(&mut self, port: usize, queue: &mut TupleQueue) {
        let tuples = match self.availability.by_count {
            TupleAvailabilityByCount::Exact => queue.poll(self.availability.tuple_count(port)),
            TupleAvailabilityByCount::AtLeast => queue.poll_all(),
        };
        self.result.add_all(port, tuples);
    }
}

impl TupleQueueDrainer for TupleCountDrainer {
    fn drain(&mut self, _may_skip_blocking: bool, key: Option<&PartitionKey>, queues: &mut [TupleQueue]) {
        let counts = &self.availability.tuple_counts;
        let ports: Vec<usize> = match self.availability.by_port {
            TupleAvailabilityByPort::AnyPort => (0..queues.len())
                .filter(|p| is_port_satisfied(counts, *p, &queues[*p]))
                .collect(),
            TupleAvailabilityByPort::AllPorts => {
                if is_drainable(counts, TupleAvailabilityByPort::AllPorts, queues) {
                    (0..queues.len())
                        .filter(|p| self.availability.tuple_count(*p) > 0)
                        .collect()
                } else {
                    Vec::new()
                }
            }
        };
        for port in ports {
            self.drain_port(port, &mut queues[port]);
        }
        if !self.result.is_empty() {
            self.key = key.cloned();
        }
    }

    fn result(&self) -> &Tuples {
        &self.result
    }

    fn key(&self) -> Option<&PartitionKey> {
        self.key.as_ref()
    }

    fn take(&mut self) -> (Option<PartitionKey>, Tuples) {
        let port_count = self.availability.port_count();
        let result = std::mem::replace(&mut self.result, Tuples::new(port_count));
        (self.key.take(), result)
    }

    fn reset(&mut self) {
        self.key = None;
        self.result = Tuples::new(self.availability.port_count());
    }
}

/// A port with a zero threshold is not referenced and never satisfied.
pub(crate) fn is_port_satisfied(tuple_counts: &[usize], port: usize, queue: &TupleQueue) -> bool {
    let required = tuple_counts.get(port).copied().unwrap_or(0);
    required > 0 && queue.len() >= required
}

/// Whether `queues` satisfy `tuple_counts` under `by_port`.
pub(crate) fn is_drainable(
    tuple_counts: &[usize],
    by_port: TupleAvailabilityByPort,
    queues: &[TupleQueue],
) -> bool {
    let mut referenced = (0..queues.len())
        .filter(|p| tuple_counts.get(*p).copied().unwrap_or(0) > 0)
        .peekable();
    match by_port {
        TupleAvailabilityByPort::AnyPort => {
            referenced.any(|p| is_port_satisfied(tuple_counts, p, &queues[p]))
        }
        TupleAvailabilityByPort::AllPorts => {
            referenced.peek().is_some()
                && referenced.all(|p| is_port_satisfied(tuple_counts, p, &queues[p]))
        }
    }
}

#[cfg(test)]
#[path = "tests/drainer_tests.rs"]
mod tests;
