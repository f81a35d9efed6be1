//! # Tuple queue container
//!
//! Buffers the input of one partition of a partitioned stateful operator,
//! keyed by partition key, with one [`TupleQueue`] per input port and key.
//!
//! The container tracks which keys are *drainable*, i.e. currently satisfy the
//! operator's tuple-count thresholds under its availability mode:
//!
//! - `offer` re-checks only the offered key, so tracking costs O(ports) per tuple.
//! - `set_tuple_counts` replaces the thresholds and rescans every buffered key.
//! - `drain` hands one drainable key (or, for a greedy drainer, every key) to
//!   the drainer.
//!
//! A container is owned by exactly one operator replica and touched only by
//! the runner thread that currently executes that replica.

use ahash::{AHashMap, AHashSet};
use anyhow::{Result, ensure};
use tracing::warn;

use crate::operator::TupleAvailabilityByPort;
use crate::types::{PartitionKey, Tuple};

use super::{TupleQueue, TupleQueueDrainer, is_drainable};

#[derive(Debug)]
pub struct TupleQueueContainer {
    operator_id: String,
    input_port_count: usize,
    partition_id: usize,
    tuple_queues_by_key: AHashMap<PartitionKey, Vec<TupleQueue>>,
    drainable_keys: AHashSet<PartitionKey>,
    tuple_counts: Vec<usize>,
    by_port: TupleAvailabilityByPort,
}

impl TupleQueueContainer {
    /// New container requiring one tuple on any port.
    pub fn new(operator_id: impl Into<String>, input_port_count: usize, partition_id: usize) -> Self {
        Self {
            operator_id: operator_id.into(),
            input_port_count,
            partition_id,
            tuple_queues_by_key: AHashMap::new(),
            drainable_keys: AHashSet::new(),
            tuple_counts: vec![1; input_port_count],
            by_port: TupleAvailabilityByPort::AnyPort,
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn partition_id(&self) -> usize {
        self.partition_id
    }

    pub fn input_port_count(&self) -> usize {
        self.input_port_count
    }

    /// Buffers `tuple` for `key`. Returns true if the key became drainable.
    pub fn offer(&mut self, port: usize, tuple: Tuple, key: PartitionKey) -> bool {
        let input_port_count = self.input_port_count;
        let queues = self
            .tuple_queues_by_key
            .entry(key.clone())
            .or_insert_with(|| vec![TupleQueue::new(); input_port_count]);
        queues[port].offer(tuple);
        if self.drainable_keys.contains(&key) {
            return false;
        }
        if is_drainable(&self.tuple_counts, self.by_port, queues) {
            self.drainable_keys.insert(key);
            return true;
        }
        false
    }

    /// Drains keys into `drainer` and returns how many keys left the drainable set.
    ///
    /// A greedy drainer removes keys one by one, drainable or not, and stops at
    /// the first key that yields output. Any other drainer takes one drainable key.
    pub fn drain(&mut self, may_skip_blocking: bool, drainer: &mut dyn TupleQueueDrainer) -> usize {
        let mut removed_drainable = 0;
        if drainer.is_greedy() {
            let keys: Vec<PartitionKey> = self.tuple_queues_by_key.keys().cloned().collect();
            for key in keys {
                let Some(mut queues) = self.tuple_queues_by_key.remove(&key) else {
                    continue;
                };
                drainer.drain(may_skip_blocking, Some(&key), &mut queues);
                if self.drainable_keys.remove(&key) {
                    removed_drainable += 1;
                }
                if !drainer.result().is_empty() {
                    return removed_drainable;
                }
            }
            drainer.reset();
        } else {
            let Some(key) = self.drainable_keys.iter().next().cloned() else {
                return 0;
            };
            let Some(queues) = self.tuple_queues_by_key.get_mut(&key) else {
                self.drainable_keys.remove(&key);
                return 1;
            };
            drainer.drain(may_skip_blocking, Some(&key), queues);
            if !is_drainable(&self.tuple_counts, self.by_port, queues) {
                let exhausted = queues.iter().all(TupleQueue::is_empty);
                self.drainable_keys.remove(&key);
                if exhausted {
                    self.tuple_queues_by_key.remove(&key);
                }
                removed_drainable += 1;
            }
        }
        removed_drainable
    }

    /// Replaces the thresholds and recomputes the drainable set from scratch.
    pub fn set_tuple_counts(&mut self, tuple_counts: &[usize], by_port: TupleAvailabilityByPort) -> Result<()> {
        ensure!(
            tuple_counts.len() == self.input_port_count,
            "mismatching input port counts for tuple queue container of operator {}: expected {}, got {}",
            self.operator_id,
            self.input_port_count,
            tuple_counts.len()
        );
        self.tuple_counts = tuple_counts.to_vec();
        self.by_port = by_port;
        self.drainable_keys = self
            .tuple_queues_by_key
            .iter()
            .filter(|(_, queues)| is_drainable(&self.tuple_counts, self.by_port, queues))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(())
    }

    pub fn tuple_counts(&self) -> &[usize] {
        &self.tuple_counts
    }

    pub fn availability_by_port(&self) -> TupleAvailabilityByPort {
        self.by_port
    }

    /// Drops every buffered tuple. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for (key, queues) in self.tuple_queues_by_key.iter_mut() {
            for (port, queue) in queues.iter_mut().enumerate() {
                if !queue.is_empty() {
                    warn!(
                        operator = %self.operator_id,
                        partition_id = self.partition_id,
                        %key,
                        port,
                        size = queue.len(),
                        "clearing non-empty tuple queue"
                    );
                    dropped += queue.clear();
                }
            }
        }
        self.tuple_queues_by_key.clear();
        self.drainable_keys.clear();
        dropped
    }

    pub fn drainable_key_count(&self) -> usize {
        self.drainable_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.tuple_queues_by_key.len()
    }

    /// Adds the buffered tuple count of every port to `counts`.
    pub fn add_available_tuple_counts(&self, counts: &mut [usize]) {
        for queues in self.tuple_queues_by_key.values() {
            for (port, queue) in queues.iter().enumerate() {
                if let Some(count) = counts.get_mut(port) {
                    *count += queue.len();
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tuple_queues_by_key
            .values()
            .all(|queues| queues.iter().all(TupleQueue::is_empty))
    }
}

#[cfg(test)]
#[path = "tests/container_tests.rs"]
mod tests;
